//! Factory test mode.
//!
//! Entered only with the magic signature words, and left only by USB reset.
//! On entry it runs a compressor self-exercise over a slice of our own
//! firmware text and reports timings over RTT, which doubles as a sanity
//! check of the SRAM and flash buses on fresh boards.

use rtt_target::rprintln;

use flux_probe_bsp::clock::Clock;
use flux_probe_core::huffman::{header_is_verbatim, header_len, HuffmanState};
use flux_probe_core::protocol::Ack;
use flux_probe_core::time::TIME_MHZ;

use crate::usb::USB;

/// Bytes of firmware text compressed by the self-exercise.
const NR: usize = 4000;

/// Start of our own text in flash.
const TEXT_BASE: *const u8 = 0x0800_4000 as *const u8;

// The historical harness trained the code on a slightly different slice
// than it compressed; keep the model and input distinct here too.
const MODEL_TEXT_OFFSET: usize = 1024;
const INPUT_TEXT_OFFSET: usize = 1204;

static mut HUFFMAN: HuffmanState = HuffmanState::new();
static mut BUFFER: [u8; 7096] = [0; 7096];

pub struct TestMode {
    selftest_done: bool,
}

impl TestMode {
    pub const fn new() -> Self {
        TestMode {
            selftest_done: false,
        }
    }

    pub fn init(&mut self) -> Ack {
        self.selftest_done = false;
        Ack::Okay
    }

    pub fn process(&mut self, clock: &Clock, usb: &mut USB) {
        if !self.selftest_done {
            self.selftest_done = true;
            huffman_selftest(clock);
        }

        // Discard host traffic; test mode ends on USB reset.
        let mut buf = [0u8; crate::USB_HS_MPS as usize];
        let _ = usb.read_packet(&mut buf);
    }
}

fn huffman_selftest(clock: &Clock) {
    let text = unsafe {
        core::slice::from_raw_parts(TEXT_BASE, INPUT_TEXT_OFFSET + NR)
    };
    let state = unsafe { &mut HUFFMAN };
    let buffer = unsafe { &mut BUFFER };

    // Model block: a full byte ramp so every symbol has a code, then 2 KiB
    // of firmware text for realistic frequencies. Staged past the region
    // the compressed output can reach.
    let (out, model) = buffer.split_at_mut(4096);
    for (i, b) in model[..256].iter_mut().enumerate() {
        *b = i as u8;
    }
    model[256..256 + 2048].copy_from_slice(&text[MODEL_TEXT_OFFSET..MODEL_TEXT_OFFSET + 2048]);
    let model = &model[..256 + 2048];
    let input = &text[INPUT_TEXT_OFFSET..INPUT_TEXT_OFFSET + NR];

    let t = clock.now();
    let nr = state.compress(Some(model), input, out);
    let t = clock.now().wrapping_sub(t);
    rprintln!("huffman: {} -> {} bytes, {} us", NR, nr, t / TIME_MHZ);

    let t = clock.now();
    if header_is_verbatim(out) {
        rprintln!("huffman: verbatim {}", header_len(out) - 2);
    } else {
        // Decode into the historical 1 KiB diagnostic ring.
        let mut window = [0u8; 1024];
        let n = state.decompress_windowed(model, &out[2..nr], &mut window);
        let ok = n == NR
            && window[(n - 1) & 1023] == input[n - 1]
            && window[(n - 512) & 1023] == input[n - 512];
        rprintln!(
            "huffman: decoded {} bytes, {} us ({})",
            n,
            clock.now().wrapping_sub(t) / TIME_MHZ,
            if ok { "OK" } else { "MISMATCH" }
        );
    }
}
