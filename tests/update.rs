//! Firmware update scenarios against a simulated bootloader: the page
//! protocol, CRC rejection and retransmission.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use canbridge::command::Command;
use canbridge::event::Event;
use canbridge::router::{BOOTLOADER_CMD_ID, BOOTLOADER_RESP_ID};
use canbridge::update::{CRC32, MAGIC, PAGE_SIZE};
use canbridge::Frame;
use common::{Harness, SimDevice};

fn letter(l: u8) -> Frame {
    Frame::new(BOOTLOADER_RESP_ID, &[l]).unwrap()
}

#[derive(Default)]
struct SimLoader {
    got_magic: bool,
    total_pages: Option<u32>,
    page_buf: Vec<u8>,
    pages: Vec<Vec<u8>>,
    awaiting_crc: bool,
    /// Reject the first CRC presented for this page index.
    fail_page_once: Option<usize>,
    failed: bool,
}

impl SimLoader {
    fn respond(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.id != BOOTLOADER_CMD_ID {
            return Vec::new();
        }
        // 4-byte frames are protocol words, 8-byte frames are page data
        if frame.dlc == 4 {
            let word = u32::from_le_bytes(frame.payload().try_into().unwrap());
            if !self.got_magic {
                assert_eq!(word, MAGIC, "handshake must lead with the magic word");
                self.got_magic = true;
            } else if self.total_pages.is_none() {
                self.total_pages = Some(word);
            } else if self.awaiting_crc {
                self.awaiting_crc = false;
                let expected = CRC32.checksum(&self.page_buf);
                let reject = self.fail_page_once == Some(self.pages.len()) && !self.failed;
                if word != expected || reject {
                    self.failed = reject;
                    self.page_buf.clear();
                    return vec![letter(b'E')];
                }
                self.pages.push(std::mem::take(&mut self.page_buf));
                let mut replies = vec![letter(b'P')];
                if Some(self.pages.len() as u32) == self.total_pages {
                    replies.push(letter(b'D'));
                }
                return replies;
            }
            return Vec::new();
        }
        if frame.dlc == 8 && self.total_pages.is_some() {
            self.page_buf.extend_from_slice(frame.payload());
            if self.page_buf.len() >= PAGE_SIZE {
                self.awaiting_crc = true;
                return vec![letter(b'C')];
            }
        }
        Vec::new()
    }
}

/// Connected harness whose bus responder is the device plus a bootloader.
fn update_harness(
    fail_page_once: Option<usize>,
) -> (Harness, Rc<RefCell<SimLoader>>, String, Vec<u8>, tempfile::TempDir) {
    // 1.5 pages of image: the second page needs 0xFF padding
    let image: Vec<u8> = (0..1536u32).map(|i| (i % 251) as u8).collect();
    let dir = tempfile::TempDir::new().unwrap();
    let path_buf = dir.path().join("firmware.bin");
    std::fs::write(&path_buf, &image).unwrap();
    let path = path_buf.to_str().unwrap().to_owned();

    let loader = Rc::new(RefCell::new(SimLoader {
        fail_page_once,
        ..SimLoader::default()
    }));
    let loader_handle = loader.clone();

    let (_device, mut device_responder) = SimDevice::new(3).into_responder();
    let mut h = Harness::new();
    h.bus.set_responder(Box::new(move |frame| {
        let mut out = device_responder(frame);
        out.extend(loader_handle.borrow_mut().respond(frame));
        out
    }));

    h.send(1, 1, Command::Connect { node_id: 3, serial: None });
    h.run_ms(300, 5);
    h.drain_events();
    (h, loader, path, image, dir)
}

fn padded_pages(image: &[u8]) -> Vec<Vec<u8>> {
    image
        .chunks(PAGE_SIZE)
        .map(|c| {
            let mut page = vec![0xFF; PAGE_SIZE];
            page[..c.len()].copy_from_slice(c);
            page
        })
        .collect()
}

#[test]
fn happy_path_streams_every_page_and_completes() {
    let (mut h, loader, path, image, _dir) = update_harness(None);
    h.send(1, 5, Command::FirmwareUpload { path });
    h.run_ms(50, 5);
    // the bootloader says hello after the reset
    h.bus.push_rx(letter(b'S'));
    h.run_ms(2000, 5);

    let done = h.drain_where(|e| matches!(e, Event::UpdateDone));
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].request_id, 5);

    let loader = loader.borrow();
    assert_eq!(loader.total_pages, Some(2));
    assert_eq!(loader.pages, padded_pages(&image));
}

#[test]
fn progress_is_reported_per_page() {
    let (mut h, _loader, path, _image, _dir) = update_harness(None);
    h.send(1, 5, Command::FirmwareUpload { path });
    h.run_ms(50, 5);
    h.bus.push_rx(letter(b'S'));
    h.run_ms(2000, 5);

    let progress = h.drain_where(|e| matches!(e, Event::UpdateProgress { .. }));
    assert_eq!(progress.len(), 2);
    match &progress[0].event {
        Event::UpdateProgress { page, total } => {
            assert_eq!(*page, 1);
            assert_eq!(*total, 2);
        }
        _ => unreachable!(),
    }
}

#[test]
fn crc_reject_resends_the_same_page() {
    let (mut h, loader, path, image, _dir) = update_harness(Some(0));
    h.send(1, 5, Command::FirmwareUpload { path });
    h.run_ms(50, 5);
    h.bus.push_rx(letter(b'S'));
    h.run_ms(3000, 5);

    let done = h.drain_where(|e| matches!(e, Event::UpdateDone));
    assert_eq!(done.len(), 1, "retry must converge");

    // the accepted pages are still exactly the image: the retried page was
    // rewound, not advanced
    let loader = loader.borrow();
    assert_eq!(loader.pages, padded_pages(&image));
}

#[test]
fn silence_times_the_session_out() {
    let (mut h, _loader, path, _image, _dir) = update_harness(None);
    h.send(1, 5, Command::FirmwareUpload { path });
    // no hello ever arrives
    h.run_ms(6000, 10);
    let errors = h.drain_where(|e| matches!(e, Event::Error { .. }));
    assert!(errors
        .iter()
        .any(|o| matches!(&o.event, Event::Error { kind, .. } if kind == "timeout")));
}
