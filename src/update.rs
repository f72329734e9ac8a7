//! Firmware update driver: the bootloader page protocol.
//!
//! The bootloader speaks a single-letter alphabet on its response id: `S`
//! (hello, send header), `C` (send the page CRC), `P` (page accepted, next
//! one), `E` (CRC mismatch, resend the page), `D` (image accepted, done).
//! The driver is purely reactive after the initial device reset; pages are
//! streamed in slices of a few frames per tick so the loop never stalls.

use std::io::Cursor;
use std::time::Duration;

use binrw::{binrw, BinWrite};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::bus::{CanBus, TxStatus};
use crate::event::{Event, EventSink};
use crate::router::BOOTLOADER_CMD_ID;
use crate::{Frame, GatewayError};

/// CRC-32, IEEE polynomial. The CAN-IO integrity marker reuses this exact
/// routine.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Bootloader pages are fixed 1 KiB, i.e. 128 full frames.
pub const PAGE_SIZE: usize = 1024;
/// Handshake word expected by the bootloader after its hello.
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Frames pushed per tick while streaming a page.
const FRAMES_PER_TICK: usize = 16;
/// Give up when the bootloader goes quiet this long.
const RESPONSE_TIMEOUT_MS: u64 = 5_000;

/// Little-endian command word (magic, page count, page CRC).
#[binrw]
#[brw(little)]
struct LoaderWord {
    value: u32,
}

fn word_frame(value: u32) -> Frame {
    let mut c = Cursor::new(Vec::new());
    // writing a u32 into a memory buffer cannot fail
    LoaderWord { value }.write(&mut c).unwrap();
    Frame::new(BOOTLOADER_CMD_ID, c.get_ref()).unwrap()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    /// Device reset issued, waiting for the bootloader hello.
    AwaitHello,
    /// Streaming page frames.
    SendPage,
    /// Page fully streamed, waiting for the CRC request.
    AwaitCrcRequest,
    /// CRC sent, waiting for accept/reject.
    AwaitPageAck,
    /// All pages acked, waiting for the final letter.
    AwaitDone,
}

pub struct FirmwareUpdate {
    stage: Stage,
    image: Vec<u8>,
    total_pages: usize,
    page: usize,
    cursor: usize,
    last_rx_ms: u64,
    client: u32,
    request_id: u32,
}

impl FirmwareUpdate {
    pub fn new() -> Self {
        FirmwareUpdate {
            stage: Stage::Idle,
            image: Vec::new(),
            total_pages: 0,
            page: 0,
            cursor: 0,
            last_rx_ms: 0,
            client: 0,
            request_id: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stage != Stage::Idle
    }

    /// Arm the driver with an image. The caller resets the device; the
    /// bootloader hello kicks everything else off.
    pub fn start(
        &mut self,
        image: Vec<u8>,
        client: u32,
        request_id: u32,
        now_ms: u64,
    ) -> Result<(), GatewayError> {
        if self.is_active() {
            return Err(GatewayError::BadState("update already running".into()));
        }
        if image.is_empty() {
            return Err(GatewayError::Parse("empty firmware image".into()));
        }
        self.total_pages = image.len().div_ceil(PAGE_SIZE);
        self.image = image;
        self.page = 0;
        self.cursor = 0;
        self.last_rx_ms = now_ms;
        self.client = client;
        self.request_id = request_id;
        self.stage = Stage::AwaitHello;
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.stage = Stage::Idle;
        self.image.clear();
    }

    /// Current page, padded with 0xFF past the image end.
    fn page_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0xFFu8; PAGE_SIZE];
        let start = self.page * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(self.image.len());
        if start < end {
            buf[..end - start].copy_from_slice(&self.image[start..end]);
        }
        buf
    }

    fn fail(&mut self, events: &EventSink, err: &GatewayError) {
        log::error!("firmware update failed on page {}: {err}", self.page);
        events.reply(
            self.client,
            self.request_id,
            Event::Error {
                kind: err.kind().to_owned(),
                message: err.to_string(),
            },
        );
        self.cancel();
    }

    /// Stream pending page frames and watch the silence timeout.
    pub fn process(&mut self, bus: &mut dyn CanBus, events: &EventSink, now_ms: u64) {
        if self.stage == Stage::Idle {
            return;
        }
        if now_ms.saturating_sub(self.last_rx_ms) >= RESPONSE_TIMEOUT_MS {
            self.fail(events, &GatewayError::Timeout);
            return;
        }
        if self.stage != Stage::SendPage {
            return;
        }
        let page = self.page_bytes();
        for _ in 0..FRAMES_PER_TICK {
            if self.cursor >= PAGE_SIZE {
                break;
            }
            let chunk = &page[self.cursor..self.cursor + 8];
            let frame = Frame::new(BOOTLOADER_CMD_ID, chunk).unwrap();
            match bus.transmit(&frame, Duration::from_millis(10)) {
                TxStatus::Sent => self.cursor += 8,
                TxStatus::Busy | TxStatus::Timeout => break, // retry next tick
            }
        }
        if self.cursor >= PAGE_SIZE {
            self.stage = Stage::AwaitCrcRequest;
        }
    }

    /// One bootloader response letter.
    pub fn on_bootloader_frame(
        &mut self,
        frame: &Frame,
        bus: &mut dyn CanBus,
        events: &EventSink,
        now_ms: u64,
    ) {
        if self.stage == Stage::Idle || frame.dlc == 0 {
            return;
        }
        self.last_rx_ms = now_ms;
        match frame.data[0] {
            b'S' => {
                // hello: handshake, then announce the page count
                bus.transmit(&word_frame(MAGIC), Duration::from_millis(10));
                bus.transmit(&word_frame(self.total_pages as u32), Duration::from_millis(10));
                self.page = 0;
                self.cursor = 0;
                self.stage = Stage::SendPage;
            }
            b'C' => {
                let crc = CRC32.checksum(&self.page_bytes());
                bus.transmit(&word_frame(crc), Duration::from_millis(10));
                self.stage = Stage::AwaitPageAck;
            }
            b'P' => {
                self.page += 1;
                self.cursor = 0;
                events.reply(
                    self.client,
                    self.request_id,
                    Event::UpdateProgress {
                        page: self.page,
                        total: self.total_pages,
                    },
                );
                self.stage = if self.page >= self.total_pages {
                    Stage::AwaitDone
                } else {
                    Stage::SendPage
                };
            }
            b'E' => {
                // CRC mismatch: rewind and stream the same page again
                log::warn!("bootloader rejected page {}, resending", self.page);
                self.cursor = 0;
                self.stage = Stage::SendPage;
            }
            b'D' => {
                events.reply(self.client, self.request_id, Event::UpdateDone);
                self.cancel();
            }
            other => {
                log::debug!("unknown bootloader letter {other:#04x}");
            }
        }
    }
}

impl Default for FirmwareUpdate {
    fn default() -> Self {
        Self::new()
    }
}
