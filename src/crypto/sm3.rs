//! SM3 hash module
//!
//! GB/T 32905-2016 256-bit hash with a streaming interface. `sum` reads
//! the digest without consuming the running state.

/// Digest size in bytes
pub const SIZE: usize = 32;

/// Block size in bytes
pub const BLOCK_SIZE: usize = 64;

const IV: [u32; 8] = [
    0x7380166f, 0x4914b2b9, 0x172442d7, 0xda8a0600,
    0xa96f30bc, 0x163138aa, 0xe38dee4d, 0xb0fb0e4e,
];

/// Streaming SM3 hasher
#[derive(Debug, Clone)]
pub struct Sm3 {
    /// Chaining value
    state: [u32; 8],
    /// Partial block awaiting compression
    buffer: [u8; BLOCK_SIZE],
    /// Bytes held in `buffer`
    buffered: usize,
    /// Total bytes absorbed
    length: u64,
}

impl Default for Sm3 {
    fn default() -> Self {
        Self::new()
    }
}

impl Sm3 {
    /// Create a hasher in its initial state
    pub fn new() -> Self {
        Self {
            state: IV,
            buffer: [0u8; BLOCK_SIZE],
            buffered: 0,
            length: 0,
        }
    }

    /// Return to the initial state
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Absorb `data`
    pub fn write(&mut self, mut data: &[u8]) {
        self.length = self.length.wrapping_add(data.len() as u64);

        if self.buffered > 0 {
            let take = (BLOCK_SIZE - self.buffered).min(data.len());
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];
            if self.buffered < BLOCK_SIZE {
                return;
            }
            let block = self.buffer;
            compress(&mut self.state, &block);
            self.buffered = 0;
        }

        while data.len() >= BLOCK_SIZE {
            let (block, rest) = data.split_at(BLOCK_SIZE);
            compress(&mut self.state, block);
            data = rest;
        }

        self.buffer[..data.len()].copy_from_slice(data);
        self.buffered = data.len();
    }

    /// Digest of everything absorbed so far
    pub fn sum(&self) -> [u8; SIZE] {
        let mut tail = self.clone();
        let bit_len = self.length.wrapping_mul(8);

        let mut pad = [0u8; BLOCK_SIZE * 2];
        pad[0] = 0x80;
        let pad_len = if self.buffered < 56 { 56 - self.buffered } else { 120 - self.buffered };
        pad[pad_len..pad_len + 8].copy_from_slice(&bit_len.to_be_bytes());
        tail.write(&pad[..pad_len + 8]);
        debug_assert_eq!(tail.buffered, 0);

        let mut out = [0u8; SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(tail.state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

/// One-shot SM3 digest
pub fn sm3(data: &[u8]) -> [u8; SIZE] {
    let mut h = Sm3::new();
    h.write(data);
    h.sum()
}

#[inline]
fn p0(x: u32) -> u32 {
    x ^ x.rotate_left(9) ^ x.rotate_left(17)
}

#[inline]
fn p1(x: u32) -> u32 {
    x ^ x.rotate_left(15) ^ x.rotate_left(23)
}

#[inline]
fn ff(j: usize, x: u32, y: u32, z: u32) -> u32 {
    if j < 16 {
        x ^ y ^ z
    } else {
        (x & y) | (x & z) | (y & z)
    }
}

#[inline]
fn gg(j: usize, x: u32, y: u32, z: u32) -> u32 {
    if j < 16 {
        x ^ y ^ z
    } else {
        (x & y) | (!x & z)
    }
}

#[inline]
fn kk(j: usize) -> u32 {
    if j < 16 {
        0x79cc4519
    } else {
        0x7a879d8a
    }
}

fn compress(state: &mut [u32; 8], block: &[u8]) {
    let mut w = [0u32; 68];
    let mut w1 = [0u32; 64];

    for (i, chunk) in block.chunks_exact(4).enumerate() {
        w[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    for j in 16..68 {
        w[j] = p1(w[j - 16] ^ w[j - 9] ^ w[j - 3].rotate_left(15)) ^ w[j - 13].rotate_left(7) ^ w[j - 6];
    }
    for j in 0..64 {
        w1[j] = w[j] ^ w[j + 4];
    }

    let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = *state;

    for j in 0..64 {
        let a12 = a.rotate_left(12);
        let ss1 = a12
            .wrapping_add(e)
            .wrapping_add(kk(j).rotate_left((j % 32) as u32))
            .rotate_left(7);
        let ss2 = ss1 ^ a12;
        let tt1 = ff(j, a, b, c)
            .wrapping_add(d)
            .wrapping_add(ss2)
            .wrapping_add(w1[j]);
        let tt2 = gg(j, e, f, g)
            .wrapping_add(h)
            .wrapping_add(ss1)
            .wrapping_add(w[j]);
        d = c;
        c = b.rotate_left(9);
        b = a;
        a = tt1;
        h = g;
        g = f.rotate_left(19);
        f = e;
        e = p0(tt2);
    }

    state[0] ^= a;
    state[1] ^= b;
    state[2] ^= c;
    state[3] ^= d;
    state[4] ^= e;
    state[5] ^= f;
    state[6] ^= g;
    state[7] ^= h;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_sum(data: &[u8]) -> String {
        hex::encode_upper(sm3(data))
    }

    #[test]
    fn test_abc() {
        assert_eq!(
            hex_sum(b"abc"),
            "66C7F0F462EEEDD9D1F2D46BDC10E4E24167C4875CF2F7A2297DA02B8F4BA8E0"
        );
    }

    #[test]
    fn test_abcd_x16() {
        assert_eq!(
            hex_sum("abcd".repeat(16).as_bytes()),
            "DEBE9FF92275B8A138604889C18E5A4D6FDB70E5387E5765293DCBA39C0C5732"
        );
    }

    #[test]
    fn test_sentences() {
        let cases = [
            (
                "Discard medicine more than two years old.",
                "8A89BD24087AE6F9A3AAE485BFA9ECD276F909A04B248EAB1B4F9BE2B24F0111",
            ),
            (
                "He who has a shady past knows that nice guys finish last.",
                "2BB6C53AD20EAF2552425F44E72D96D1B61E63310A1A30F4E5406A103619177D",
            ),
            (
                "I wouldn't marry him with a ten foot pole.",
                "5ECEC640017AFD77D00147EF42FDB8E7901F089A62C1888637917E89BB3A6532",
            ),
            (
                "The fugacity of a constituent in a mixture of gases at a given temperature is proportional to its mole fraction.",
                "87E709CF62ACADCA93B8012483041BA7113446285E6FC20DAE868FC0557A2CC5",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(hex_sum(input.as_bytes()), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_sum_is_idempotent() {
        let mut h = Sm3::new();
        h.write(b"ab");
        let first = h.sum();
        assert_eq!(first, h.sum());
        h.write(b"c");
        assert_eq!(hex::encode_upper(h.sum()), hex_sum(b"abc"));
    }

    #[test]
    fn test_chunked_writes_match_one_shot() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let mut h = Sm3::new();
        for chunk in data.chunks(13) {
            h.write(chunk);
        }
        assert_eq!(h.sum(), sm3(&data));
    }

    #[test]
    fn test_reset() {
        let mut h = Sm3::new();
        h.write(b"garbage");
        h.reset();
        h.write(b"abc");
        assert_eq!(h.sum(), sm3(b"abc"));
        let mut empty = Sm3::new();
        empty.write(b"x");
        empty.reset();
        assert_eq!(empty.sum(), sm3(b""));
    }
}
