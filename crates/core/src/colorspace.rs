//! Conversion of raw PDF image samples into the canonical RGB8 pixel form.
//!
//! PDF image streams store `width * components` samples per row, packed at
//! `bits_per_component` bits each and padded to a byte boundary at the end of
//! every row. Everything here works on already-unfiltered bytes.

use image::{Rgb, RgbImage};

#[derive(Debug, Clone, PartialEq)]
pub enum ColorModel {
    Gray,
    Rgb,
    Cmyk,
    Indexed {
        base: Box<ColorModel>,
        hival: u8,
        lookup: Vec<u8>,
    },
}

/// Why an image could not be turned into pixels.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeFailure {
    /// The encoding or color model is outside what the extractor handles.
    Unsupported(String),
    /// The image claims a supported form but its data is inconsistent.
    Corrupt(String),
}

impl ColorModel {
    pub fn components(&self) -> usize {
        match self {
            ColorModel::Gray | ColorModel::Indexed { .. } => 1,
            ColorModel::Rgb => 3,
            ColorModel::Cmyk => 4,
        }
    }

    pub fn from_component_count(count: i64) -> Option<Self> {
        match count {
            1 => Some(ColorModel::Gray),
            3 => Some(ColorModel::Rgb),
            4 => Some(ColorModel::Cmyk),
            _ => None,
        }
    }

    fn to_rgb(&self, samples: &[u8]) -> [u8; 3] {
        match self {
            ColorModel::Gray => [samples[0]; 3],
            ColorModel::Rgb => [samples[0], samples[1], samples[2]],
            ColorModel::Cmyk => cmyk_to_rgb(samples[0], samples[1], samples[2], samples[3]),
            ColorModel::Indexed { base, hival, lookup } => {
                let index = samples[0].min(*hival) as usize;
                let width = base.components();
                let start = index * width;
                match lookup.get(start..start + width) {
                    Some(entry) => base.to_rgb(entry),
                    None => [0, 0, 0],
                }
            }
        }
    }
}

fn cmyk_to_rgb(c: u8, m: u8, y: u8, k: u8) -> [u8; 3] {
    let white = 255 - k as u32;
    let channel = |value: u8| ((255 - value as u32) * white / 255) as u8;
    [channel(c), channel(m), channel(y)]
}

/// Largest raster the decoder will expand to RGB8.
pub const MAX_IMAGE_PIXELS: u64 = 1 << 27;

/// Bytes per packed row and for the whole image, `None` on overflow.
pub fn sample_layout(
    width: u32,
    height: u32,
    components: usize,
    bits_per_component: usize,
) -> Option<(usize, usize)> {
    let row_bits = usize::try_from(width)
        .ok()?
        .checked_mul(components)?
        .checked_mul(bits_per_component)?;
    let row_bytes = row_bits.div_ceil(8);
    let total = row_bytes.checked_mul(usize::try_from(height).ok()?)?;
    Some((row_bytes, total))
}

/// Unpacks `data` into an RGB8 image.
pub fn samples_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    bits_per_component: u8,
    model: &ColorModel,
) -> Result<RgbImage, DecodeFailure> {
    if width == 0 || height == 0 {
        return Err(DecodeFailure::Corrupt(format!(
            "image has empty extent {width}x{height}"
        )));
    }
    if !matches!(bits_per_component, 1 | 2 | 4 | 8 | 16) {
        return Err(DecodeFailure::Unsupported(format!(
            "{bits_per_component} bits per component"
        )));
    }
    if let ColorModel::Indexed { base, lookup, hival } = model {
        if matches!(**base, ColorModel::Indexed { .. }) {
            return Err(DecodeFailure::Unsupported(
                "indexed color space over an indexed base".to_string(),
            ));
        }
        if bits_per_component == 16 {
            return Err(DecodeFailure::Corrupt(
                "indexed images cannot use 16 bits per component".to_string(),
            ));
        }
        if lookup.len() < (*hival as usize + 1) * base.components() {
            return Err(DecodeFailure::Corrupt(format!(
                "indexed lookup table has {} bytes for {} entries",
                lookup.len(),
                *hival as usize + 1
            )));
        }
    }

    let components = model.components();
    let bits = bits_per_component as usize;
    let (row_bytes, needed) = sample_layout(width, height, components, bits).ok_or_else(|| {
        DecodeFailure::Corrupt(format!("image extent {width}x{height} overflows"))
    })?;
    if data.len() < needed {
        return Err(DecodeFailure::Corrupt(format!(
            "image data is truncated: {} bytes for {width}x{height}, expected {needed}",
            data.len()
        )));
    }
    if u64::from(width) * u64::from(height) > MAX_IMAGE_PIXELS {
        return Err(DecodeFailure::Unsupported(format!(
            "{width}x{height} image exceeds {MAX_IMAGE_PIXELS} pixels"
        )));
    }

    let scale = !matches!(model, ColorModel::Indexed { .. });
    let mut output = RgbImage::new(width, height);
    let mut pixel = vec![0u8; components];

    for y in 0..height {
        let row = &data[y as usize * row_bytes..(y as usize + 1) * row_bytes];
        for x in 0..width {
            for (component, slot) in pixel.iter_mut().enumerate() {
                let sample_index = x as usize * components + component;
                *slot = read_sample(row, sample_index, bits, scale);
            }
            output.put_pixel(x, y, Rgb(model.to_rgb(&pixel)));
        }
    }

    Ok(output)
}

fn read_sample(row: &[u8], sample_index: usize, bits: usize, scale: bool) -> u8 {
    match bits {
        8 => row[sample_index],
        // Keep the high byte of big-endian 16-bit samples.
        16 => row[sample_index * 2],
        _ => {
            let bit_offset = sample_index * bits;
            let byte = row[bit_offset / 8];
            let shift = 8 - bits - (bit_offset % 8);
            let max = (1u16 << bits) - 1;
            let value = ((byte >> shift) as u16) & max;
            if scale {
                (value * 255 / max) as u8
            } else {
                value as u8
            }
        }
    }
}
