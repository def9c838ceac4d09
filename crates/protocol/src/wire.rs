//! Wire-level constants shared by both peers.
//!
//! Everything in this module is part of the on-the-wire format and must not
//! change between releases.

/// Size of the frame header: `u32` frame size plus `u32` object type.
pub const FRAME_HEADER_LEN: usize = 8;

/// Object type reserved for stream frames.
pub const STREAM_OBJECT_TYPE: u32 = 0xFFFF_FFFF;

/// Stream size announcing a stream of uncertain length.
pub const STREAM_SIZE_UNCERTAIN: u32 = 0xFFFF_FFFF;

/// Fixed 32-byte identity string exchanged by both peers before the first
/// frame. Zero-padded to [`HANDSHAKE_LEN`].
pub const HANDSHAKE_IDENT: &[u8] = b"vault-backup-protocol:v=1";

/// Length of the handshake exchange.
pub const HANDSHAKE_LEN: usize = 32;

/// Default cap on object frame payloads. Commands and replies are small;
/// bulk data travels as streams.
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 16 * 1024;

/// Default per-operation timeout: 15 minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Uncertain-stream chunk header announcing end-of-stream.
pub const STREAM_HEADER_END: u8 = 0;

/// Largest chunk header that indexes [`STREAM_SIZE_TABLE`].
pub const STREAM_HEADER_MAX_ENCODED: u8 = 252;

/// Chunk header announcing exactly 64 KiB of payload.
pub const STREAM_HEADER_64K: u8 = 253;

/// Bytes carried by a [`STREAM_HEADER_64K`] chunk.
pub const STREAM_64K_SIZE: usize = 64 * 1024;

/// Returns the handshake block: the identity string zero-padded to
/// [`HANDSHAKE_LEN`] bytes.
#[must_use]
pub fn handshake_block() -> [u8; HANDSHAKE_LEN] {
    let mut block = [0u8; HANDSHAKE_LEN];
    block[..HANDSHAKE_IDENT.len()].copy_from_slice(HANDSHAKE_IDENT);
    block
}

/// Chunk payload sizes for uncertain-size streams, indexed by the header
/// byte. Entry 0 is end-of-stream, entries 1..=252 are payload sizes
/// covering 1..=64512 in coarsening steps, 253 means 64 KiB and 254/255 are
/// reserved. This table is wire format: it is carried over verbatim and
/// must never be edited.
pub const STREAM_SIZE_TABLE: [u16; 256] = [
    0, 1, 2, 3, 4, 5, 6, 7,
    8, 9, 10, 11, 12, 13, 14, 15,
    16, 17, 18, 19, 20, 21, 22, 23,
    24, 25, 26, 27, 28, 29, 30, 31,
    32, 33, 34, 35, 36, 37, 38, 39,
    40, 41, 42, 43, 44, 45, 46, 47,
    48, 49, 50, 51, 52, 53, 54, 55,
    56, 57, 58, 59, 60, 61, 62, 63,
    64, 72, 80, 88, 96, 104, 112, 120,
    128, 136, 144, 152, 160, 168, 176, 184,
    192, 200, 208, 216, 224, 232, 240, 248,
    256, 264, 272, 280, 288, 296, 304, 312,
    320, 336, 352, 368, 384, 400, 416, 432,
    448, 464, 480, 496, 512, 528, 544, 560,
    576, 608, 640, 672, 704, 736, 768, 800,
    832, 864, 896, 928, 960, 992, 1024, 1056,
    1088, 1152, 1216, 1280, 1344, 1408, 1472, 1536,
    1664, 1792, 1920, 2048, 2176, 2304, 2432, 2560,
    2688, 2816, 2944, 3072, 3328, 3584, 3840, 4096,
    4352, 4608, 4864, 5120, 5376, 5632, 5888, 6144,
    6656, 7168, 7680, 8192, 8704, 9216, 9728, 10240,
    10752, 11264, 11776, 12288, 12800, 13312, 13824, 14336,
    14848, 15360, 15872, 16384, 16896, 17408, 17920, 18432,
    18944, 19456, 19968, 20480, 20992, 21504, 22016, 22528,
    23040, 23552, 24064, 24576, 25088, 25600, 26112, 26624,
    27136, 27648, 28160, 28672, 29184, 29696, 30208, 30720,
    31232, 31744, 32256, 32768, 33280, 33792, 34304, 34816,
    35328, 35840, 36352, 36864, 37376, 37888, 38400, 38912,
    39424, 39936, 40448, 40960, 41472, 41984, 42496, 43008,
    44032, 45056, 46080, 47104, 48128, 49152, 50176, 51200,
    52224, 53248, 54272, 55296, 56320, 57344, 58368, 59392,
    60416, 61440, 62464, 63488, 64512, 0, 0, 0,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_block_is_padded_ident() {
        let block = handshake_block();
        assert_eq!(block.len(), HANDSHAKE_LEN);
        assert!(block.starts_with(HANDSHAKE_IDENT));
        assert!(block[HANDSHAKE_IDENT.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn size_table_matches_its_generation_schedule() {
        // The table was generated by starting at zero and growing the
        // increment at fixed indices. Re-derive it to guard against
        // accidental edits.
        let mut expected = [0u16; 256];
        let mut value: u32 = 0;
        for (index, slot) in expected.iter_mut().enumerate() {
            *slot = value as u16;
            let increment = match index {
                0..=63 => 1,
                64..=95 => 8,
                96..=111 => 16,
                112..=127 => 32,
                128..=134 => 64,
                135..=146 => 128,
                147..=158 => 256,
                159..=230 => 512,
                _ => 1024,
            };
            value += increment;
        }
        expected[253] = 0;
        expected[254] = 0;
        expected[255] = 0;
        assert_eq!(STREAM_SIZE_TABLE, expected);
    }

    #[test]
    fn size_table_is_monotone_over_encoded_headers() {
        for header in 2..=usize::from(STREAM_HEADER_MAX_ENCODED) {
            assert!(STREAM_SIZE_TABLE[header] > STREAM_SIZE_TABLE[header - 1]);
        }
        assert_eq!(STREAM_SIZE_TABLE[usize::from(STREAM_HEADER_MAX_ENCODED)], 64512);
    }
}
