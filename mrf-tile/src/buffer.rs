//! Page buffer helpers: interleaving, uniform detection, byte swapping and
//! nodata fill.
//!
//! All functions work on raw bytes. Samples are `width` bytes wide, where
//! `width` is one of 1, 2, 4 or 8.

use crate::image::DataType;
use snafu::{Snafu, ensure};

/// A sample width the buffer helpers cannot handle.
#[derive(Debug, Snafu)]
#[snafu(display("samples of {width} bytes are not supported"))]
pub struct UnsupportedWidth {
    pub width: usize,
}

fn check_width(width: usize) -> Result<(), UnsupportedWidth> {
    ensure!(matches!(width, 1 | 2 | 4 | 8), UnsupportedWidthSnafu { width });
    Ok(())
}

/// Gathers every `stride`-th sample of `src` into the contiguous `dst`.
///
/// `src` starts at the first sample to copy. The number of samples copied is
/// `dst.len() / width`.
pub fn copy_stride_in(
    dst: &mut [u8],
    src: &[u8],
    width: usize,
    stride: usize,
) -> Result<(), UnsupportedWidth> {
    match width {
        1 => stride_in::<1>(dst, src, stride),
        2 => stride_in::<2>(dst, src, stride),
        4 => stride_in::<4>(dst, src, stride),
        8 => stride_in::<8>(dst, src, stride),
        _ => return UnsupportedWidthSnafu { width }.fail(),
    }

    Ok(())
}

/// Scatters the contiguous samples of `src` into every `stride`-th sample of
/// `dst`.
///
/// `dst` starts at the first sample slot to fill. The number of samples copied
/// is `src.len() / width`.
pub fn copy_stride_out(
    dst: &mut [u8],
    src: &[u8],
    width: usize,
    stride: usize,
) -> Result<(), UnsupportedWidth> {
    match width {
        1 => stride_out::<1>(dst, src, stride),
        2 => stride_out::<2>(dst, src, stride),
        4 => stride_out::<4>(dst, src, stride),
        8 => stride_out::<8>(dst, src, stride),
        _ => return UnsupportedWidthSnafu { width }.fail(),
    }

    Ok(())
}

fn stride_in<const W: usize>(dst: &mut [u8], src: &[u8], stride: usize) {
    for (i, d) in dst.chunks_exact_mut(W).enumerate() {
        let s = i * stride * W;
        d.copy_from_slice(&src[s..s + W]);
    }
}

fn stride_out<const W: usize>(dst: &mut [u8], src: &[u8], stride: usize) {
    for (i, s) in src.chunks_exact(W).enumerate() {
        let d = i * stride * W;
        dst[d..d + W].copy_from_slice(s);
    }
}

#[must_use]
pub fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Returns `true` if every byte of `buf` equals `val`.
#[must_use]
pub fn is_uniform(buf: &[u8], val: u8) -> bool {
    buf.iter().all(|&b| b == val)
}

/// Whether a decoded page holds nothing worth storing.
///
/// Byte rasters with a nodata value compare against that value, everything
/// else is considered empty only when all bytes are zero.
#[must_use]
pub fn is_empty_page(buf: &[u8], data_type: DataType, nodata: Option<f64>) -> bool {
    match nodata {
        Some(ndv) if data_type == DataType::Byte => is_uniform(buf, ndv as u8),
        _ => is_zero(buf),
    }
}

/// Reverses the byte order of every sample in place.
pub fn swap_bytes(buf: &mut [u8], width: usize) -> Result<(), UnsupportedWidth> {
    check_width(width)?;

    if width > 1 {
        buf.chunks_exact_mut(width).for_each(<[u8]>::reverse);
    }

    Ok(())
}

/// Fills `buf` with the nodata value, or zero when nodata is undefined.
///
/// Samples are written in host byte order.
pub fn fill(buf: &mut [u8], data_type: DataType, nodata: Option<f64>) {
    match nodata {
        None => buf.fill(0),
        Some(ndv) if data_type == DataType::Byte => buf.fill(ndv as u8),
        Some(ndv) => {
            let mut sample = [0u8; 8];
            let width = data_type.size();
            write_sample(data_type, ndv, &mut sample[..width]);

            for chunk in buf.chunks_exact_mut(width) {
                chunk.copy_from_slice(&sample[..width]);
            }
        }
    }
}

/// Decodes one host order sample.
#[must_use]
pub fn read_sample(data_type: DataType, bytes: &[u8]) -> f64 {
    fn arr<const N: usize>(b: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&b[..N]);
        out
    }

    match data_type {
        DataType::Byte => f64::from(bytes[0]),
        DataType::UInt16 => f64::from(u16::from_ne_bytes(arr(bytes))),
        DataType::Int16 => f64::from(i16::from_ne_bytes(arr(bytes))),
        DataType::UInt32 => f64::from(u32::from_ne_bytes(arr(bytes))),
        DataType::Int32 => f64::from(i32::from_ne_bytes(arr(bytes))),
        DataType::Float32 => f64::from(f32::from_ne_bytes(arr(bytes))),
        DataType::Float64 => f64::from_ne_bytes(arr(bytes)),
    }
}

/// Encodes one host order sample, saturating integer types.
pub fn write_sample(data_type: DataType, value: f64, out: &mut [u8]) {
    match data_type {
        DataType::Byte => out[0] = value as u8,
        DataType::UInt16 => out[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
        DataType::Int16 => out[..2].copy_from_slice(&(value as i16).to_ne_bytes()),
        DataType::UInt32 => out[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
        DataType::Int32 => out[..4].copy_from_slice(&(value as i32).to_ne_bytes()),
        DataType::Float32 => out[..4].copy_from_slice(&(value as f32).to_ne_bytes()),
        DataType::Float64 => out[..8].copy_from_slice(&value.to_ne_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    fn test_stride_out_then_in(#[case] width: usize) {
        let channels = 3;
        let samples = 16;
        let bands: Vec<Vec<u8>> = (0..channels)
            .map(|c| {
                (0..samples * width)
                    .map(|i| (i * 7 + c * 31) as u8)
                    .collect()
            })
            .collect();

        let mut page = vec![0u8; samples * width * channels];
        for (c, band) in bands.iter().enumerate() {
            copy_stride_out(&mut page[c * width..], band, width, channels).unwrap();
        }

        // Pixel 1 of channel 2 sits right after pixel 1 of channel 1.
        let p1c2 = (channels + 2) * width;
        assert_eq!(&page[p1c2..p1c2 + width], &bands[2][width..2 * width]);

        for (c, band) in bands.iter().enumerate() {
            let mut back = vec![0u8; samples * width];
            copy_stride_in(&mut back, &page[c * width..], width, channels).unwrap();
            assert_eq!(&back, band);
        }
    }

    #[test]
    fn test_unsupported_width() {
        let mut dst = [0u8; 6];
        assert!(copy_stride_in(&mut dst, &[0u8; 18], 3, 3).is_err());
        assert!(swap_bytes(&mut dst, 3).is_err());
    }

    #[test]
    fn test_swap_bytes() {
        let mut buf = 0x0102_0304u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&0x0506_0708u32.to_be_bytes());
        swap_bytes(&mut buf, 4).unwrap();
        assert_eq!(buf, [4, 3, 2, 1, 8, 7, 6, 5]);

        let mut single = [1u8, 2, 3];
        swap_bytes(&mut single, 1).unwrap();
        assert_eq!(single, [1, 2, 3]);
    }

    #[test]
    fn test_empty_page_classification() {
        assert!(is_empty_page(&[0; 8], DataType::UInt16, Some(7.0)));
        assert!(!is_empty_page(&[7; 8], DataType::UInt16, Some(7.0)));
        assert!(is_empty_page(&[7; 8], DataType::Byte, Some(7.0)));
        assert!(!is_empty_page(&[0; 8], DataType::Byte, Some(7.0)));
        assert!(is_empty_page(&[0; 8], DataType::Byte, None));
    }

    #[test]
    fn test_fill_typed_nodata() {
        let mut buf = [0u8; 8];
        fill(&mut buf, DataType::Int16, Some(-9999.0));
        for chunk in buf.chunks_exact(2) {
            assert_eq!(i16::from_ne_bytes([chunk[0], chunk[1]]), -9999);
        }

        fill(&mut buf, DataType::Float32, None);
        assert!(is_zero(&buf));

        fill(&mut buf, DataType::Byte, Some(255.0));
        assert!(is_uniform(&buf, 255));
    }

    #[test]
    fn test_sample_round_trip() {
        let mut out = [0u8; 8];
        for dt in [DataType::UInt16, DataType::Int32, DataType::Float32, DataType::Float64] {
            write_sample(dt, 1234.0, &mut out);
            assert_eq!(read_sample(dt, &out), 1234.0);
        }
    }
}
