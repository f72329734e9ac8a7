//! canbridge binary: socketcan backend, JSON-line transport on stdio.
//!
//! Each stdin line is one command object, each stdout line one event object.
//! The real deployment puts a socket server in front of the same two queues;
//! this wiring is enough to drive a gateway from a terminal or a pipe.

use std::io::{BufRead, Write};
use std::path::Path;

use canbridge::command::{self, GatewayInput};
use canbridge::event::{self, EventSink, OutboundEvent};
use canbridge::store::DeviceStore;
use canbridge::{Gateway, GatewayConfig, MonotonicClock, SocketCanBus};

fn main() {
    env_logger::init();

    let interface = std::env::var("CANBRIDGE_IF").unwrap_or_else(|_| "can0".to_owned());
    let state_dir = std::env::var("CANBRIDGE_STATE").unwrap_or_else(|_| "./state".to_owned());

    let bus = match SocketCanBus::open(&interface) {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("cannot open {interface}: {e}");
            std::process::exit(1);
        }
    };
    let store = match DeviceStore::open(Path::new(&state_dir)) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("cannot open state dir {state_dir}: {e}");
            std::process::exit(1);
        }
    };

    let (command_tx, command_rx) = crossbeam_channel::bounded::<GatewayInput>(32);
    let (event_tx, event_rx) = crossbeam_channel::bounded::<OutboundEvent>(256);

    // stdin -> command queue
    let stdin_tx = command_tx.clone();
    std::thread::spawn(move || {
        const CLIENT: u32 = 1;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match command::parse(CLIENT, &line) {
                Ok(cmd) => {
                    if stdin_tx.send(GatewayInput::Client(cmd)).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("bad command line: {e}"),
            }
        }
        let _ = stdin_tx.send(GatewayInput::ClientGone(CLIENT));
        let _ = stdin_tx.send(GatewayInput::Shutdown);
    });

    // event queue -> stdout
    std::thread::spawn(move || {
        let stdout = std::io::stdout();
        for out in event_rx.iter() {
            let mut handle = stdout.lock();
            if writeln!(handle, "{}", event::to_json(&out)).is_err() {
                break;
            }
        }
    });

    let mut gateway = Gateway::new(
        bus,
        MonotonicClock::new(),
        store,
        GatewayConfig::default(),
        command_rx,
        EventSink::new(event_tx),
    );
    gateway.run();
}
