//! Frame Encryption
//!
//! The machine scrambles every GATT payload with a nibble shuffle keyed by a
//! single byte taken from its advertisement. The transform is an involution,
//! so the same function encrypts and decrypts.

const NUMBERS1: [u8; 16] = [14, 4, 3, 2, 1, 13, 8, 11, 6, 15, 12, 7, 10, 5, 0, 9];
const NUMBERS2: [u8; 16] = [10, 6, 13, 12, 14, 11, 1, 9, 15, 7, 0, 5, 3, 2, 4, 8];

/// Session key from byte 0 of the manufacturer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptionKey(pub u8);

impl EncryptionKey {
    pub fn byte(self) -> u8 {
        self.0
    }
}

/// Shuffle a single nibble. All arithmetic is modulo 16; `count` is the
/// running nibble index within the frame.
fn shuffle(nibble: u8, count: usize, key_left: u8, key_right: u8) -> u8 {
    let c = count as u8;
    let high = (count >> 4) as u8;

    let t1 = NUMBERS1[(nibble.wrapping_add(c).wrapping_add(key_left) & 0x0F) as usize];
    let t2 = NUMBERS2[(t1
        .wrapping_add(key_right)
        .wrapping_add(high)
        .wrapping_sub(c)
        .wrapping_sub(key_left)
        & 0x0F) as usize];
    let t3 = NUMBERS1[(t2
        .wrapping_add(key_left)
        .wrapping_add(c)
        .wrapping_sub(key_right)
        .wrapping_sub(high)
        & 0x0F) as usize];

    t3.wrapping_sub(c).wrapping_sub(key_left) & 0x0F
}

/// Encrypt or decrypt `data` with `key`.
pub fn transform(data: &[u8], key: EncryptionKey) -> Vec<u8> {
    let key_left = key.0 >> 4;
    let key_right = key.0 & 0x0F;

    data.iter()
        .enumerate()
        .map(|(i, byte)| {
            let count = i * 2;
            let left = shuffle(byte >> 4, count, key_left, key_right);
            let right = shuffle(byte & 0x0F, count + 1, key_left, key_right);
            (left << 4) | right
        })
        .collect()
}

/// Encrypt an outbound frame. Byte 0 is replaced by the key first; the
/// firmware expects it there regardless of payload.
pub fn encrypt_frame(frame: &[u8], key: EncryptionKey) -> Vec<u8> {
    let mut data = frame.to_vec();
    if let Some(first) = data.first_mut() {
        *first = key.0;
    }
    transform(&data, key)
}
