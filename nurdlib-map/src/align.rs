use crate::BltMode;

/// Byte alignment a [`BltMode`] requires for the start of a block transfer.
pub const fn alignment(mode: BltMode) -> usize {
    match mode {
        BltMode::NoBlt | BltMode::Blt | BltMode::Ff => 4,
        BltMode::Mblt => 8,
        BltMode::TwoESst | BltMode::TwoEVme => 16,
    }
}

/// Rounds `bytes` up to the alignment `mode` requires, reporting how many
/// filler bytes (as repeats of `filler`, written big-endian) were appended.
///
/// Mirrors `map_align`: the caller hands us the write cursor and the number
/// of bytes already written into it; we hand back the padded byte count and
/// the filler words to splice in. The actual pointer bump lives with the
/// caller since in safe Rust the "pointer" is a cursor into an owned buffer.
pub fn align(bytes: usize, mode: BltMode, filler: u32) -> (usize, Vec<u8>) {
    let a = alignment(mode);
    let padded = (bytes + a - 1) / a * a;
    let pad_len = padded - bytes;
    let mut filler_bytes = Vec::with_capacity(pad_len);
    while filler_bytes.len() < pad_len {
        let remaining = pad_len - filler_bytes.len();
        let word = filler.to_be_bytes();
        filler_bytes.extend_from_slice(&word[..remaining.min(4)]);
    }
    (padded, filler_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blt_aligns_to_4() {
        let (padded, fill) = align(13, BltMode::Blt, 0xdead_beef);
        assert_eq!(padded, 16);
        assert_eq!(fill.len(), 3);
    }

    #[test]
    fn mblt_aligns_to_8() {
        let (padded, fill) = align(9, BltMode::Mblt, 0xffff_ffff);
        assert_eq!(padded, 16);
        assert_eq!(fill, vec![0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn two_esst_aligns_to_16_and_is_idempotent() {
        let (padded, fill) = align(16, BltMode::TwoESst, 0);
        assert_eq!(padded, 16);
        assert!(fill.is_empty());
    }

    #[test]
    fn padding_never_exceeds_alignment_minus_one() {
        for mode in [
            BltMode::NoBlt,
            BltMode::Blt,
            BltMode::Ff,
            BltMode::Mblt,
            BltMode::TwoESst,
            BltMode::TwoEVme,
        ] {
            for start in 0..32usize {
                let (padded, fill) = align(start, mode, 0);
                assert!(padded - start < alignment(mode));
                assert_eq!(fill.len(), padded - start);
            }
        }
    }
}
