use crate::colorspace::{sample_layout, samples_to_rgb, ColorModel, DecodeFailure};
use crate::error::SearchError;
use crate::models::{ExtractedImage, PdfDocument};
use flate2::read::ZlibDecoder;
use image::{ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::borrow::Cow;
use std::collections::HashSet;
use std::io::Read;
use tracing::{debug, warn};

const MAX_TREE_DEPTH: usize = 32;

/// Ceiling on what a single stream may inflate to.
const MAX_INFLATED_BYTES: u64 = 256 * 1024 * 1024;

/// Tolerance for trailing bytes past the declared raster size.
const INFLATE_SLACK_BYTES: u64 = 4096;

const MAX_LOOKUP_TABLE_BYTES: u64 = 64 * 1024;

pub trait DocumentImageExtractor: Send + Sync {
    /// Decodes every supported embedded raster image, page by page, in the
    /// order each page's XObject catalog lists them. `source_index` is the
    /// position in the returned sequence.
    fn extract(&self, document: &PdfDocument) -> Result<Vec<ExtractedImage>, SearchError>;

    fn page_count(&self, document: &PdfDocument) -> Result<usize, SearchError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfImageExtractor;

impl DocumentImageExtractor for LopdfImageExtractor {
    fn extract(&self, document: &PdfDocument) -> Result<Vec<ExtractedImage>, SearchError> {
        let pdf = load(document)?;

        let mut images = Vec::new();
        for (page_number, page_id) in pdf.get_pages() {
            for (object_id, stream) in page_image_streams(&pdf, page_id)? {
                match decode_image_stream(&pdf, stream) {
                    Ok(pixels) => images.push(ExtractedImage {
                        source_index: images.len(),
                        page_number: Some(page_number),
                        pixels,
                    }),
                    Err(DecodeFailure::Unsupported(reason)) => {
                        warn!(
                            page = page_number,
                            object = object_id.0,
                            %reason,
                            "skipping embedded image"
                        );
                    }
                    Err(DecodeFailure::Corrupt(reason)) => {
                        return Err(SearchError::DocumentParse(format!(
                            "page {page_number}, image object {} {}: {reason}",
                            object_id.0, object_id.1
                        )));
                    }
                }
            }
        }

        debug!(
            document = document.name().unwrap_or("<memory>"),
            image_count = images.len(),
            "extracted images"
        );
        Ok(images)
    }

    fn page_count(&self, document: &PdfDocument) -> Result<usize, SearchError> {
        Ok(load(document)?.get_pages().len())
    }
}

pub fn extract_images(document: &PdfDocument) -> Result<Vec<ExtractedImage>, SearchError> {
    LopdfImageExtractor.extract(document)
}

fn load(document: &PdfDocument) -> Result<Document, SearchError> {
    Document::load_mem(document.bytes())
        .map_err(|error| SearchError::DocumentParse(error.to_string()))
}

fn resolve<'a>(pdf: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => pdf.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(pdf: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match resolve(pdf, object)? {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn lookup<'a>(pdf: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    dict.get(key).ok().and_then(|object| resolve(pdf, object))
}

fn as_name(object: Option<&Object>) -> Option<&[u8]> {
    match object {
        Some(Object::Name(name)) => Some(name.as_slice()),
        _ => None,
    }
}

fn as_integer(object: Option<&Object>) -> Option<i64> {
    match object {
        Some(Object::Integer(value)) => Some(*value),
        Some(Object::Real(value)) => Some(*value as i64),
        _ => None,
    }
}

/// Page resources, falling back to the nearest ancestor in the page tree.
fn page_resources(pdf: &Document, page_id: ObjectId) -> Result<Option<&Dictionary>, SearchError> {
    let mut node = pdf
        .get_dictionary(page_id)
        .map_err(|error| SearchError::DocumentParse(error.to_string()))?;

    for _ in 0..MAX_TREE_DEPTH {
        if let Some(resources) = node.get(b"Resources").ok().and_then(|o| resolve_dict(pdf, o)) {
            return Ok(Some(resources));
        }
        match node.get(b"Parent").ok().and_then(|o| resolve_dict(pdf, o)) {
            Some(parent) => node = parent,
            None => break,
        }
    }

    Ok(None)
}

fn page_image_streams(
    pdf: &Document,
    page_id: ObjectId,
) -> Result<Vec<(ObjectId, &Stream)>, SearchError> {
    let mut found = Vec::new();
    if let Some(resources) = page_resources(pdf, page_id)? {
        let mut visited = HashSet::new();
        collect_images(pdf, resources, &mut visited, &mut found, 0);
    }
    Ok(found)
}

fn collect_images<'a>(
    pdf: &'a Document,
    resources: &'a Dictionary,
    visited: &mut HashSet<ObjectId>,
    found: &mut Vec<(ObjectId, &'a Stream)>,
    depth: usize,
) {
    let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| resolve_dict(pdf, o)) else {
        return;
    };

    for (_, entry) in xobjects.iter() {
        let Object::Reference(id) = entry else {
            continue;
        };
        if !visited.insert(*id) {
            continue;
        }
        let Ok(Object::Stream(stream)) = pdf.get_object(*id) else {
            continue;
        };

        match as_name(stream.dict.get(b"Subtype").ok()) {
            Some(b"Image") => found.push((*id, stream)),
            Some(b"Form") if depth < MAX_TREE_DEPTH => {
                if let Some(form_resources) = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|o| resolve_dict(pdf, o))
                {
                    collect_images(pdf, form_resources, visited, found, depth + 1);
                }
            }
            _ => {}
        }
    }
}

fn decode_image_stream(pdf: &Document, stream: &Stream) -> Result<RgbImage, DecodeFailure> {
    let dict = &stream.dict;
    let filters = filter_chain(pdf, dict);
    let params = decode_params(pdf, dict, filters.len());
    let format = raster_format(pdf, dict);
    let limit = inflate_limit(&filters, format.as_ref().ok());

    let mut data = Cow::Borrowed(stream.content.as_slice());
    for (position, filter) in filters.iter().enumerate() {
        match filter.as_slice() {
            b"FlateDecode" | b"Fl" => {
                data = Cow::Owned(flate_decode(&data, params[position], limit)?);
            }
            b"DCTDecode" | b"DCT" if position + 1 == filters.len() => {
                return decode_jpeg(&data);
            }
            other => {
                return Err(DecodeFailure::Unsupported(format!(
                    "{} filter",
                    String::from_utf8_lossy(other)
                )));
            }
        }
    }

    let format = format?;
    samples_to_rgb(&data, format.width, format.height, format.bits, &format.model)
}

/// Geometry and sample layout a raw (non-JPEG) image stream declares.
struct RasterFormat {
    width: u32,
    height: u32,
    bits: u8,
    model: ColorModel,
}

fn raster_format(pdf: &Document, dict: &Dictionary) -> Result<RasterFormat, DecodeFailure> {
    let width = dimension(pdf, dict, b"Width")?;
    let height = dimension(pdf, dict, b"Height")?;

    if matches!(lookup(pdf, dict, b"ImageMask"), Some(Object::Boolean(true))) {
        return Ok(RasterFormat {
            width,
            height,
            bits: 1,
            model: ColorModel::Gray,
        });
    }

    let bits = as_integer(lookup(pdf, dict, b"BitsPerComponent"))
        .ok_or_else(|| DecodeFailure::Corrupt("image has no BitsPerComponent".to_string()))?;
    let bits = u8::try_from(bits)
        .map_err(|_| DecodeFailure::Corrupt(format!("{bits} bits per component")))?;
    let model = match dict.get(b"ColorSpace").ok() {
        Some(object) => parse_color_space(pdf, object, 0)?,
        None => return Err(DecodeFailure::Corrupt("image has no ColorSpace".to_string())),
    };

    Ok(RasterFormat {
        width,
        height,
        bits,
        model,
    })
}

/// Raw rasters may inflate to their declared size plus one predictor byte
/// per row. JPEG payloads have no declared size and get the global ceiling.
fn inflate_limit(filters: &[Vec<u8>], format: Option<&RasterFormat>) -> u64 {
    let has_dct = filters
        .iter()
        .any(|filter| matches!(filter.as_slice(), b"DCTDecode" | b"DCT"));
    let declared = format.filter(|_| !has_dct).and_then(|format| {
        let (row_bytes, _) = sample_layout(
            format.width,
            format.height,
            format.model.components(),
            format.bits as usize,
        )?;
        (row_bytes as u64)
            .checked_add(1)?
            .checked_mul(u64::from(format.height))
    });

    declared.map_or(MAX_INFLATED_BYTES, |bytes| {
        bytes.saturating_add(INFLATE_SLACK_BYTES).min(MAX_INFLATED_BYTES)
    })
}

fn dimension(pdf: &Document, dict: &Dictionary, key: &[u8]) -> Result<u32, DecodeFailure> {
    as_integer(lookup(pdf, dict, key))
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value > 0)
        .ok_or_else(|| {
            DecodeFailure::Corrupt(format!(
                "missing or invalid {}",
                String::from_utf8_lossy(key)
            ))
        })
}

fn filter_chain(pdf: &Document, dict: &Dictionary) -> Vec<Vec<u8>> {
    match lookup(pdf, dict, b"Filter") {
        Some(Object::Name(name)) => vec![name.clone()],
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|item| as_name(resolve(pdf, item)).map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_params<'a>(pdf: &'a Document, dict: &'a Dictionary, count: usize) -> Vec<Option<&'a Dictionary>> {
    let mut params = match lookup(pdf, dict, b"DecodeParms") {
        Some(Object::Dictionary(single)) => vec![Some(single)],
        Some(Object::Array(items)) => items.iter().map(|item| resolve_dict(pdf, item)).collect(),
        _ => Vec::new(),
    };
    params.resize(count, None);
    params
}

fn decode_jpeg(data: &[u8]) -> Result<RgbImage, DecodeFailure> {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|decoded| decoded.to_rgb8())
        .map_err(|error| DecodeFailure::Corrupt(format!("jpeg data: {error}")))
}

fn flate_decode(
    data: &[u8],
    params: Option<&Dictionary>,
    limit: u64,
) -> Result<Vec<u8>, DecodeFailure> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut inflated)
        .map_err(|error| DecodeFailure::Corrupt(format!("flate stream: {error}")))?;
    if inflated.len() as u64 > limit {
        return Err(DecodeFailure::Corrupt(format!(
            "flate stream inflates past {limit} bytes"
        )));
    }

    let param = |key: &[u8], default: i64| {
        params
            .and_then(|dict| as_integer(dict.get(key).ok()))
            .unwrap_or(default)
    };

    match param(b"Predictor", 1) {
        1 => Ok(inflated),
        10..=15 => png_unpredict(
            &inflated,
            param(b"Colors", 1),
            param(b"BitsPerComponent", 8),
            param(b"Columns", 1),
        ),
        other => Err(DecodeFailure::Unsupported(format!("predictor {other}"))),
    }
}

/// Reverses PNG row filters: every row carries a leading filter-type byte.
fn png_unpredict(
    data: &[u8],
    colors: i64,
    bits_per_component: i64,
    columns: i64,
) -> Result<Vec<u8>, DecodeFailure> {
    let invalid = || {
        DecodeFailure::Corrupt(format!(
            "invalid predictor parameters: Colors {colors}, BitsPerComponent {bits_per_component}, Columns {columns}"
        ))
    };
    let color_count = usize::try_from(colors)
        .ok()
        .filter(|count| (1..=32).contains(count))
        .ok_or_else(invalid)?;
    let sample_bits = usize::try_from(bits_per_component)
        .ok()
        .filter(|bits| matches!(bits, 1 | 2 | 4 | 8 | 16))
        .ok_or_else(invalid)?;
    let column_count = usize::try_from(columns)
        .ok()
        .filter(|count| *count >= 1)
        .ok_or_else(invalid)?;

    let bits_per_pixel = color_count * sample_bits;
    let stride = bits_per_pixel.div_ceil(8).max(1);
    let row_len = bits_per_pixel
        .checked_mul(column_count)
        .map(|bits| bits.div_ceil(8))
        .ok_or_else(invalid)?;
    let encoded_len = row_len.checked_add(1).ok_or_else(invalid)?;

    // Rows are sized from untrusted parameters: the data must hold whole
    // rows before anything row-sized is allocated.
    if data.is_empty() || data.len() % encoded_len != 0 {
        return Err(DecodeFailure::Corrupt(format!(
            "predicted data length {} is not a whole number of {encoded_len}-byte rows",
            data.len()
        )));
    }

    let mut output = Vec::with_capacity(data.len() / encoded_len * row_len);
    let mut previous = vec![0u8; row_len];
    for encoded in data.chunks(encoded_len) {
        let (kind, source) = (encoded[0], &encoded[1..]);
        let mut row = vec![0u8; row_len];
        for index in 0..row_len {
            let left = if index >= stride { row[index - stride] } else { 0 };
            let up = previous[index];
            let upper_left = if index >= stride { previous[index - stride] } else { 0 };
            let predicted = match kind {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, upper_left),
                other => {
                    return Err(DecodeFailure::Corrupt(format!("png filter type {other}")));
                }
            };
            row[index] = source[index].wrapping_add(predicted);
        }
        output.extend_from_slice(&row);
        previous = row;
    }

    Ok(output)
}

fn paeth(left: u8, up: u8, upper_left: u8) -> u8 {
    let estimate = left as i16 + up as i16 - upper_left as i16;
    let to_left = (estimate - left as i16).abs();
    let to_up = (estimate - up as i16).abs();
    let to_upper_left = (estimate - upper_left as i16).abs();

    if to_left <= to_up && to_left <= to_upper_left {
        left
    } else if to_up <= to_upper_left {
        up
    } else {
        upper_left
    }
}

fn parse_color_space(
    pdf: &Document,
    object: &Object,
    depth: usize,
) -> Result<ColorModel, DecodeFailure> {
    if depth > 2 {
        return Err(DecodeFailure::Unsupported("nested color space".to_string()));
    }
    let object = resolve(pdf, object)
        .ok_or_else(|| DecodeFailure::Corrupt("dangling color space reference".to_string()))?;

    let (family, items): (&[u8], &[Object]) = match object {
        Object::Name(name) => (name.as_slice(), &[]),
        Object::Array(items) => match as_name(items.first().and_then(|o| resolve(pdf, o))) {
            Some(name) => (name, &items[1..]),
            None => return Err(DecodeFailure::Corrupt("malformed color space array".to_string())),
        },
        _ => return Err(DecodeFailure::Corrupt("malformed color space".to_string())),
    };

    match family {
        b"DeviceGray" | b"CalGray" | b"G" => Ok(ColorModel::Gray),
        b"DeviceRGB" | b"CalRGB" | b"RGB" => Ok(ColorModel::Rgb),
        b"DeviceCMYK" | b"CMYK" => Ok(ColorModel::Cmyk),
        b"ICCBased" => {
            let profile = items
                .first()
                .and_then(|o| resolve_dict(pdf, o))
                .ok_or_else(|| DecodeFailure::Corrupt("ICCBased without profile".to_string()))?;
            if let Some(model) =
                as_integer(lookup(pdf, profile, b"N")).and_then(ColorModel::from_component_count)
            {
                return Ok(model);
            }
            match profile.get(b"Alternate").ok() {
                Some(alternate) => parse_color_space(pdf, alternate, depth + 1),
                None => Err(DecodeFailure::Unsupported("ICC profile component count".to_string())),
            }
        }
        b"Indexed" | b"I" => {
            let [base, hival, table, ..] = items else {
                return Err(DecodeFailure::Corrupt("short Indexed color space".to_string()));
            };
            let base = parse_color_space(pdf, base, depth + 1)?;
            let hival = as_integer(resolve(pdf, hival))
                .map(|value| value.clamp(0, 255) as u8)
                .ok_or_else(|| DecodeFailure::Corrupt("Indexed hival".to_string()))?;
            let lookup = match resolve(pdf, table) {
                Some(Object::String(bytes, _)) => bytes.clone(),
                Some(Object::Stream(stream)) => lookup_table_bytes(pdf, stream)?,
                _ => return Err(DecodeFailure::Corrupt("Indexed lookup table".to_string())),
            };
            Ok(ColorModel::Indexed {
                base: Box::new(base),
                hival,
                lookup,
            })
        }
        other => Err(DecodeFailure::Unsupported(format!(
            "{} color space",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn lookup_table_bytes(pdf: &Document, stream: &Stream) -> Result<Vec<u8>, DecodeFailure> {
    let filters = filter_chain(pdf, &stream.dict);
    match filters.as_slice() {
        [] => Ok(stream.content.clone()),
        [only] if only.as_slice() == b"FlateDecode" => {
            flate_decode(&stream.content, None, MAX_LOOKUP_TABLE_BYTES)
        }
        _ => Err(DecodeFailure::Unsupported("filtered lookup table".to_string())),
    }
}
