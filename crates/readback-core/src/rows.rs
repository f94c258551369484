//! Row copying from mapped staging memory into tightly packed output.
//!
//! Mapped staging memory is row-major but rows may be padded (D3D11
//! `RowPitch`, D3D12 footprint alignment of 256 bytes). The output is always
//! tightly packed. Backends whose native row order differs from the caller's
//! expected order copy with `flip` set.

use crate::error::ReadbackError;
use crate::target::TargetDesc;

/// Vertical order of rows in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowOrder {
    /// First row in memory is the top of the image (Direct3D).
    #[default]
    TopDown,
    /// First row in memory is the bottom of the image (OpenGL).
    BottomUp,
}

/// What `read_staging` must produce for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLayout {
    pub desc: TargetDesc,
    /// Reverse the row order while copying.
    pub flip: bool,
}

impl ReadLayout {
    pub fn new(desc: TargetDesc, native: RowOrder, wanted: RowOrder) -> Self {
        Self {
            desc,
            flip: native != wanted,
        }
    }
}

/// Minimum length of a source region holding `height` rows of `row_bytes`
/// at `pitch` bytes apart. The last row needs no trailing padding.
pub const fn required_source_len(pitch: usize, row_bytes: usize, height: usize) -> usize {
    if height == 0 {
        0
    } else {
        pitch * (height - 1) + row_bytes
    }
}

/// Copy `layout.desc.height` rows from `src` (rows `pitch` bytes apart) into
/// the tightly packed `dst`.
pub fn copy_rows(
    src: &[u8],
    pitch: usize,
    dst: &mut [u8],
    layout: &ReadLayout,
) -> Result<(), ReadbackError> {
    let row_bytes = layout.desc.row_bytes();
    let height = layout.desc.height as usize;

    if pitch < row_bytes {
        return Err(ReadbackError::copy_failed(format!(
            "row pitch {pitch} is smaller than row size {row_bytes}"
        )));
    }
    if src.len() < required_source_len(pitch, row_bytes, height) {
        return Err(ReadbackError::copy_failed(format!(
            "mapped region of {} bytes is too small for {}x{} {}",
            src.len(),
            layout.desc.width,
            layout.desc.height,
            layout.desc.format
        )));
    }
    if dst.len() != layout.desc.byte_len() {
        return Err(ReadbackError::copy_failed(format!(
            "output buffer is {} bytes, expected {}",
            dst.len(),
            layout.desc.byte_len()
        )));
    }
    if row_bytes == 0 {
        return Ok(());
    }

    // Fast path: identical layout, one memcpy.
    if pitch == row_bytes && !layout.flip {
        dst.copy_from_slice(&src[..dst.len()]);
        return Ok(());
    }

    for (row, out) in dst.chunks_exact_mut(row_bytes).enumerate() {
        let src_row = if layout.flip { height - 1 - row } else { row };
        let start = src_row * pitch;
        out.copy_from_slice(&src[start..start + row_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn layout(width: u32, height: u32, flip: bool) -> ReadLayout {
        ReadLayout {
            desc: TargetDesc::new(width, height, PixelFormat::Rgba8),
            flip,
        }
    }

    /// Three rows of one pixel each, padded to 8 bytes per row.
    fn padded_source() -> Vec<u8> {
        vec![
            1, 1, 1, 1, 0xEE, 0xEE, 0xEE, 0xEE, //
            2, 2, 2, 2, 0xEE, 0xEE, 0xEE, 0xEE, //
            3, 3, 3, 3,
        ]
    }

    #[test]
    fn strips_padding() {
        let mut dst = vec![0u8; 12];
        copy_rows(&padded_source(), 8, &mut dst, &layout(1, 3, false)).unwrap();
        assert_eq!(dst, [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn flips_rows() {
        let mut dst = vec![0u8; 12];
        copy_rows(&padded_source(), 8, &mut dst, &layout(1, 3, true)).unwrap();
        assert_eq!(dst, [3, 3, 3, 3, 2, 2, 2, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn packed_copy() {
        let src: Vec<u8> = (0..32).collect();
        let mut dst = vec![0u8; 32];
        copy_rows(&src, 8, &mut dst, &layout(2, 4, false)).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn rejects_short_source() {
        let mut dst = vec![0u8; 12];
        let err = copy_rows(&padded_source()[..19], 8, &mut dst, &layout(1, 3, false));
        assert!(matches!(err, Err(ReadbackError::CopyFailed { .. })));
    }

    #[test]
    fn rejects_wrong_output_len() {
        let mut dst = vec![0u8; 11];
        let err = copy_rows(&padded_source(), 8, &mut dst, &layout(1, 3, false));
        assert!(matches!(err, Err(ReadbackError::CopyFailed { .. })));
    }

    #[test]
    fn rejects_narrow_pitch() {
        let mut dst = vec![0u8; 24];
        let err = copy_rows(&[0u8; 64], 4, &mut dst, &layout(2, 3, false));
        assert!(matches!(err, Err(ReadbackError::CopyFailed { .. })));
    }

    #[test]
    fn layout_flip_follows_order() {
        let desc = TargetDesc::new(1, 1, PixelFormat::Rgba8);
        assert!(ReadLayout::new(desc, RowOrder::BottomUp, RowOrder::TopDown).flip);
        assert!(!ReadLayout::new(desc, RowOrder::TopDown, RowOrder::TopDown).flip);
        assert_eq!(required_source_len(8, 4, 3), 20);
        assert_eq!(required_source_len(8, 4, 0), 0);
    }
}
