//! Dump classified bus traffic. Handy against vcan0 with a second shell
//! injecting frames via `cansend`.

use std::time::Duration;

use canbridge::bus::CanBus;
use canbridge::router::{classify, RxClass};
use canbridge::sdo;
use canbridge::SocketCanBus;

fn main() {
    env_logger::init();
    let interface = std::env::var("CANBRIDGE_IF").unwrap_or_else(|_| "vcan0".to_owned());
    let mut bus = SocketCanBus::open(&interface).expect("no such interface");
    println!("listening on {interface}");
    loop {
        let Some(frame) = bus.receive(Duration::from_millis(250)) else {
            continue;
        };
        match classify(&frame) {
            RxClass::Sdo { node } => match sdo::parse_response(&frame) {
                Ok((_, response)) => println!("{frame:?}  sdo node {node}: {response:?}"),
                Err(e) => println!("{frame:?}  sdo node {node}, malformed: {e}"),
            },
            RxClass::Bootloader => {
                println!("{frame:?}  bootloader: {:?}", frame.payload().first());
            }
            RxClass::Other => println!("{frame:?}"),
        }
    }
}
