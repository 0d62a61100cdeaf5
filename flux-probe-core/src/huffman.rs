//! Single-block byte compressor over a canonical prefix code.
//!
//! The code is built from symbol frequencies counted over a *model* block,
//! which need not be the payload itself; both ends must agree on the model.
//! The alphabet is the 256 byte values plus an escape symbol (for payload
//! bytes absent from the model) and an end-of-stream symbol, both seeded
//! with count 1 so they always receive a code.
//!
//! A two-byte big-endian header carries the total block length; the top bit
//! marks a verbatim block, emitted whenever coding fails to shrink the
//! payload. Output is therefore never more than `payload + 2` bytes.
//!
//! One `u32` arena is reused for the three scratch tables with disjoint
//! lifetimes: the build-time min-heap, then either the encoder's dictionary
//! or the decoder's 8-bit prefix LUT.

pub const NR_SYMBOLS: usize = 258;
const SYM_ESC: u16 = 256;
const SYM_EOS: u16 = 257;

/// Set on a node id to mark an internal node; leaves are bare symbol ids.
const NODE_INTERNAL: u16 = 0x8000;

fn node_is_internal(n: u16) -> bool {
    n & NODE_INTERNAL != 0
}

fn node_idx(n: u16) -> usize {
    (n & 0x7fff) as usize
}

// Internal tree node: left child in the high half, right child in the low.
fn mk_node(l: u16, r: u16) -> u32 {
    ((l as u32) << 16) | r as u32
}

fn node_left(e: u32) -> u16 {
    (e >> 16) as u16
}

fn node_right(e: u32) -> u16 {
    e as u16
}

// Heap entry: node id in the high half, frequency count in the low.
fn mk_hent(node: u16, count: u16) -> u32 {
    ((node as u32) << 16) | count as u32
}

fn hent_count(e: u32) -> u16 {
    e as u16
}

fn hent_node(e: u32) -> u16 {
    (e >> 16) as u16
}

// Dictionary entry: code length in the high half, code bits in the low.
fn mk_dent(code: u16, codelen: u32) -> u32 {
    (codelen << 16) | code as u32
}

// LUT entry: code length in the high half, node or leaf id in the low.
fn mk_lent(node: u16, codelen: u32) -> u32 {
    (codelen << 16) | node as u32
}

pub struct HuffmanState {
    nodes: [u32; NR_SYMBOLS],
    /// Heap (259 entries, `[0]` holds the population), dictionary (258) or
    /// LUT (256), never live at the same time.
    scratch: [u32; NR_SYMBOLS + 1],
}

impl HuffmanState {
    pub const fn new() -> Self {
        HuffmanState {
            nodes: [0; NR_SYMBOLS],
            scratch: [0; NR_SYMBOLS + 1],
        }
    }

    fn build_tree_from_model(&mut self, model: &[u8]) -> u16 {
        let h = &mut self.scratch;
        for i in 0..256u16 {
            h[1 + i as usize] = mk_hent(i, 0);
        }
        h[1 + SYM_ESC as usize] = mk_hent(SYM_ESC, 1);
        h[1 + SYM_EOS as usize] = mk_hent(SYM_EOS, 1);
        for &b in model {
            h[1 + b as usize] += 1;
        }

        build_heap(h, NR_SYMBOLS);
        build_tree(h, &mut self.nodes)
    }

    /// Compress `msg` into `out` (which must hold `msg.len() + 2` bytes)
    /// using a code modelled on `model`. `None` forces a verbatim block.
    /// Returns the total block size including the header.
    pub fn compress(&mut self, model: Option<&[u8]>, msg: &[u8], out: &mut [u8]) -> usize {
        let model = match model {
            Some(m) => m,
            None => return verbatim(msg, out),
        };

        let root = self.build_tree_from_model(model);
        build_dict(root, &self.nodes, &mut self.scratch);
        let dict = &self.scratch;

        let mut x: u32 = 0;
        let mut bits: u32 = 0;
        let mut p = 2usize;
        let limit = 2 + msg.len();

        for &sym in msg {
            let mut dent = dict[sym as usize];
            if dent == 0 {
                // Symbol absent from the model: escape plus literal byte.
                dent = dict[SYM_ESC as usize];
                let codelen = dent >> 16;
                x <<= codelen + 8;
                x |= ((dent as u16 as u32) << 8) | sym as u32;
                bits += codelen + 8;
            } else {
                let codelen = dent >> 16;
                x <<= codelen;
                x |= dent as u16 as u32;
                bits += codelen;
            }
            while bits >= 8 {
                bits -= 8;
                out[p] = (x >> bits) as u8;
                p += 1;
            }
            if p >= limit {
                return verbatim(msg, out);
            }
        }

        let dent = dict[SYM_EOS as usize];
        let codelen = dent >> 16;
        x <<= codelen;
        x |= dent as u16 as u32;
        bits += codelen;
        while bits >= 8 {
            bits -= 8;
            if p >= limit {
                return verbatim(msg, out);
            }
            out[p] = (x >> bits) as u8;
            p += 1;
        }
        if bits > 0 {
            if p >= limit {
                return verbatim(msg, out);
            }
            out[p] = (x << (8 - bits)) as u8;
            p += 1;
        }

        out[0] = (p >> 8) as u8;
        out[1] = p as u8;
        p
    }

    /// Decompress `msg` into `out`, rebuilding the code from `model`.
    /// Returns the number of bytes produced, terminated by the embedded
    /// end-of-stream symbol.
    pub fn decompress(&mut self, model: &[u8], msg: &[u8], out: &mut [u8]) -> usize {
        self.decompress_with(model, msg, &mut |j, b| out[j] = b)
    }

    /// Decompress into a rotating window (`window.len()` a power of two),
    /// returning the total symbol count. This reproduces the historical
    /// diagnostic harness, which decoded into a 1 KiB ring rather than a
    /// flat buffer; it is not a general-purpose output mode.
    pub fn decompress_windowed(&mut self, model: &[u8], msg: &[u8], window: &mut [u8]) -> usize {
        let mask = window.len() - 1;
        self.decompress_with(model, msg, &mut |j, b| window[j & mask] = b)
    }

    fn decompress_with(
        &mut self,
        model: &[u8],
        msg: &[u8],
        emit: &mut dyn FnMut(usize, u8),
    ) -> usize {
        let root = self.build_tree_from_model(model);
        build_lut(root, &self.nodes, &mut self.scratch);
        let lut = &self.scratch;

        let mut x: u32 = 0;
        let mut bits: u32 = 0;
        let mut p = 0usize;
        let mut j = 0usize;

        loop {
            while bits < 24 {
                let b = if p < msg.len() { msg[p] } else { 0 };
                p += 1;
                x |= (b as u32) << (24 - bits);
                bits += 8;
            }

            let entry = lut[(x >> 24) as usize];
            let mut node = entry as u16;
            let codelen = entry >> 16;
            x <<= codelen;
            bits -= codelen;

            while node_is_internal(node) {
                let e = self.nodes[node_idx(node)];
                node = if (x as i32) < 0 {
                    node_right(e)
                } else {
                    node_left(e)
                };
                x <<= 1;
                bits -= 1;
            }

            if node < 256 {
                emit(j, node as u8);
                j += 1;
                continue;
            }

            match node {
                SYM_EOS => return j,
                SYM_ESC => {
                    emit(j, (x >> 24) as u8);
                    j += 1;
                    x <<= 8;
                    bits -= 8;
                }
                _ => unreachable!(),
            }
        }
    }
}

fn verbatim(msg: &[u8], out: &mut [u8]) -> usize {
    let tot = msg.len() + 2;
    out[0] = ((tot >> 8) | 0x80) as u8;
    out[1] = tot as u8;
    out[2..tot].copy_from_slice(msg);
    tot
}

/// True if a compressed block's header marks it verbatim.
pub fn header_is_verbatim(header: &[u8]) -> bool {
    header[0] & 0x80 != 0
}

/// Total block length (header included) from a block's first two bytes.
pub fn header_len(header: &[u8]) -> usize {
    (((header[0] & 0x7f) as usize) << 8) | header[1] as usize
}

/// Percolate item `i` downwards to its correct position among subheaps.
fn heap_percolate_down(heap: &mut [u32], mut i: usize) {
    let nr = heap[0] as usize;
    let x = heap[i];
    loop {
        let l = 2 * i;
        let r = 2 * i + 1;
        let mut smallest = i;
        let mut s = x;
        if l <= nr && hent_count(heap[l]) < hent_count(s) {
            smallest = l;
            s = heap[l];
        }
        if r <= nr && hent_count(heap[r]) < hent_count(s) {
            smallest = r;
            s = heap[r];
        }
        if smallest == i {
            break;
        }
        heap[i] = s;
        heap[smallest] = x;
        i = smallest;
    }
}

/// Compact away zero-frequency entries and heapify the rest.
fn build_heap(heap: &mut [u32], nr: usize) {
    let mut j = 1;
    for i in 1..=nr {
        let he = heap[i];
        if hent_count(he) != 0 {
            heap[j] = he;
            j += 1;
        }
    }
    j -= 1;
    heap[0] = j as u32;
    for i in (1..=j / 2).rev() {
        heap_percolate_down(heap, i);
    }
}

/// Standard two-pop/one-push merge until a single root remains. Internal
/// nodes are numbered by the heap slot they free up, walking downwards, so
/// node storage never collides with live heap entries.
fn build_tree(heap: &mut [u32], nodes: &mut [u32]) -> u16 {
    let mut nr = heap[0] as usize;
    loop {
        let x = heap[1];
        heap[1] = heap[nr];
        nr -= 1;
        heap[0] = nr as u32;
        if nr == 0 {
            return hent_node(x);
        }
        heap_percolate_down(heap, 1);
        let y = heap[1];
        nodes[nr] = mk_node(hent_node(x), hent_node(y));
        heap[1] = mk_hent(
            nr as u16 | NODE_INTERNAL,
            hent_count(x).wrapping_add(hent_count(y)),
        );
        heap_percolate_down(heap, 1);
    }
}

/// Depth-first walk assigning each leaf its code. The stack stores visited
/// internal nodes on left descent and a 0 marker on right descent, which is
/// enough to reconstruct the prefix on the way back up.
fn build_dict(root: u16, nodes: &[u32], dict: &mut [u32]) {
    for d in dict.iter_mut() {
        *d = 0;
    }

    let mut stack = [0u16; 32];
    let mut sp = 0usize;
    let mut node = root;
    let mut prefix: u32 = 0;
    let mut prefix_len: u32 = 0;

    loop {
        if !node_is_internal(node) {
            dict[node as usize] = mk_dent(prefix as u16, prefix_len);

            // Climb until we come back up a left-side link.
            loop {
                if sp == 0 {
                    return;
                }
                sp -= 1;
                node = stack[sp];
                prefix >>= 1;
                prefix_len -= 1;
                if node != 0 {
                    break;
                }
            }

            stack[sp] = 0;
            sp += 1;
            node = node_right(nodes[node_idx(node)]);
            prefix = (prefix << 1) | 1;
        } else {
            stack[sp] = node;
            sp += 1;
            node = node_left(nodes[node_idx(node)]);
            prefix <<= 1;
        }

        prefix_len += 1;
    }
}

/// Build the decoder's 8-bit prefix LUT: every entry covered by a short
/// code maps straight to its leaf; longer codes park the deepest internal
/// node reached at depth 8 and the decoder walks on from there.
fn build_lut(root: u16, nodes: &[u32], lut: &mut [u32]) {
    let mut stack = [0u16; 32];
    let mut sp = 0usize;
    let mut node = root;
    let mut prefix: u32 = 0;
    let mut prefix_len: u32 = 0;

    loop {
        let at_leaf = !node_is_internal(node);
        if at_leaf || prefix_len == 8 {
            if at_leaf {
                let idx = (prefix << (8 - prefix_len)) as usize;
                let nr = 1usize << (8 - prefix_len);
                for e in &mut lut[idx..idx + nr] {
                    *e = mk_lent(node, prefix_len);
                }
            } else {
                lut[prefix as usize] = mk_lent(node, prefix_len);
            }

            loop {
                if sp == 0 {
                    return;
                }
                sp -= 1;
                node = stack[sp];
                prefix >>= 1;
                prefix_len -= 1;
                if node != 0 {
                    break;
                }
            }

            stack[sp] = 0;
            sp += 1;
            node = node_right(nodes[node_idx(node)]);
            prefix = (prefix << 1) | 1;
        } else {
            stack[sp] = node;
            sp += 1;
            node = node_left(nodes[node_idx(node)]);
            prefix <<= 1;
        }

        prefix_len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &[u8], model: &[u8]) {
        let mut state = HuffmanState::new();
        let mut packed = vec![0u8; msg.len() + 2];
        let tot = state.compress(Some(model), msg, &mut packed);
        assert!(tot <= msg.len() + 2);
        assert_eq!(tot, header_len(&packed));

        let mut out = vec![0u8; msg.len() + 16];
        if header_is_verbatim(&packed) {
            assert_eq!(&packed[2..tot], msg);
        } else {
            let n = state.decompress(model, &packed[2..tot], &mut out);
            assert_eq!(&out[..n], msg);
        }
    }

    fn skewed_block(len: usize) -> Vec<u8> {
        // Text-like distribution: a few symbols dominate.
        (0..len)
            .map(|i| match i % 16 {
                0..=7 => b'e',
                8..=11 => b't',
                12..=13 => b' ',
                14 => b'q',
                _ => (i % 251) as u8,
            })
            .collect()
    }

    #[test]
    fn identity_with_payload_as_model() {
        for len in [1usize, 2, 255, 1024, 4000, 7094] {
            let msg = skewed_block(len);
            round_trip(&msg, &msg);
        }
    }

    #[test]
    fn skewed_input_actually_shrinks() {
        let msg = skewed_block(4000);
        let mut state = HuffmanState::new();
        let mut packed = vec![0u8; msg.len() + 2];
        let tot = state.compress(Some(&msg), &msg, &mut packed);
        assert!(!header_is_verbatim(&packed));
        assert!(tot < msg.len());
    }

    #[test]
    fn symbols_missing_from_the_model_use_the_escape() {
        let model = vec![b'a'; 512];
        let msg: Vec<u8> = (0..=255u8).collect();
        round_trip(&msg, &model);
    }

    #[test]
    fn incompressible_input_falls_back_to_verbatim() {
        // A uniform model gives every symbol ~8-bit codes, so coded output
        // cannot undercut the input and the verbatim path must trigger.
        let msg: Vec<u8> = (0..4096).map(|i| (i * 37 + (i >> 3)) as u8).collect();
        let mut state = HuffmanState::new();
        let mut packed = vec![0u8; msg.len() + 2];
        let tot = state.compress(Some(&msg), &msg, &mut packed);
        assert_eq!(tot, msg.len() + 2);
        assert!(header_is_verbatim(&packed));
        assert_eq!(header_len(&packed) & 0x7fff, tot);
        assert_eq!(&packed[2..], &msg[..]);
    }

    #[test]
    fn no_model_forces_verbatim() {
        let msg = b"short message";
        let mut state = HuffmanState::new();
        let mut packed = [0u8; 64];
        let tot = state.compress(None, msg, &mut packed);
        assert!(header_is_verbatim(&packed));
        assert_eq!(tot, msg.len() + 2);
    }

    #[test]
    fn windowed_decode_wraps_like_the_diagnostic_ring() {
        let msg = skewed_block(3000);
        let mut state = HuffmanState::new();
        let mut packed = vec![0u8; msg.len() + 2];
        let tot = state.compress(Some(&msg), &msg, &mut packed);
        assert!(!header_is_verbatim(&packed));

        let mut window = [0u8; 1024];
        let n = state.decompress_windowed(&msg, &packed[2..tot], &mut window);
        assert_eq!(n, msg.len());
        // The window holds the newest kilobyte, rotated by the write index.
        for (i, &b) in window.iter().enumerate() {
            let j = (msg.len() & !1023) + i;
            let src = if j < msg.len() { j } else { j - 1024 };
            assert_eq!(b, msg[src]);
        }
    }

    #[test]
    fn empty_payload_is_just_the_end_marker() {
        let model = skewed_block(256);
        round_trip(&[], &model);
    }
}
