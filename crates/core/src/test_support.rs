//! In-memory PDF fixtures for unit tests.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{DynamicImage, ImageFormat, RgbImage};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::io::{Cursor, Write};

pub(crate) struct PdfBuilder {
    doc: Document,
    pages_id: ObjectId,
    pages: Vec<ObjectId>,
    inherited: Option<Dictionary>,
}

impl PdfBuilder {
    pub(crate) fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            pages: Vec::new(),
            inherited: None,
        }
    }

    pub(crate) fn add_stream(&mut self, stream: Stream) -> ObjectId {
        self.doc.add_object(stream)
    }

    pub(crate) fn add_page(&mut self, images: &[(&str, ObjectId)]) -> ObjectId {
        let resources = dictionary! { "XObject" => xobject_dict(images) };
        self.push_page(Some(resources))
    }

    pub(crate) fn add_page_without_resources(&mut self) -> ObjectId {
        self.push_page(None)
    }

    pub(crate) fn set_inherited_images(&mut self, images: &[(&str, ObjectId)]) {
        self.inherited = Some(dictionary! { "XObject" => xobject_dict(images) });
    }

    fn push_page(&mut self, resources: Option<Dictionary>) -> ObjectId {
        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        if let Some(resources) = resources {
            page.set("Resources", resources);
        }
        let id = self.doc.add_object(page);
        self.pages.push(id);
        id
    }

    pub(crate) fn build(mut self) -> Result<Vec<u8>, lopdf::Error> {
        let kids: Vec<Object> = self.pages.iter().map(|id| Object::Reference(*id)).collect();
        let mut pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => self.pages.len() as i64,
        };
        if let Some(resources) = self.inherited.take() {
            pages.set("Resources", resources);
        }
        self.doc
            .objects
            .insert(self.pages_id, Object::Dictionary(pages));

        let catalog = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog);

        let mut buffer = Vec::new();
        self.doc.save_to(&mut buffer)?;
        Ok(buffer)
    }
}

fn xobject_dict(images: &[(&str, ObjectId)]) -> Dictionary {
    let mut dict = Dictionary::new();
    for (name, id) in images {
        dict.set(*name, Object::Reference(*id));
    }
    dict
}

fn image_dict(width: u32, height: u32, color_space: &str) -> Dictionary {
    dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => color_space,
        "BitsPerComponent" => 8,
    }
}

pub(crate) fn rgb_image_stream(width: u32, height: u32, samples: &[u8]) -> Stream {
    Stream::new(image_dict(width, height, "DeviceRGB"), samples.to_vec())
}

pub(crate) fn gray_image_stream(width: u32, height: u32, samples: &[u8]) -> Stream {
    Stream::new(image_dict(width, height, "DeviceGray"), samples.to_vec())
}

pub(crate) fn jpeg_stream(pixels: &RgbImage) -> Stream {
    let mut dict = image_dict(pixels.width(), pixels.height(), "DeviceRGB");
    dict.set("Filter", "DCTDecode");
    Stream::new(dict, encode(pixels, ImageFormat::Jpeg))
}

pub(crate) fn flate_stream(mut dict: Dictionary, raw: &[u8]) -> std::io::Result<Stream> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    dict.set("Filter", "FlateDecode");
    Ok(Stream::new(dict, encoder.finish()?))
}

pub(crate) fn encode(pixels: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(pixels.clone())
        .write_to(&mut buffer, format)
        .expect("in-memory image encoding should succeed");
    buffer.into_inner()
}

/// A single-page PDF holding one solid-colored RGB image per entry.
pub(crate) fn solid_color_pdf(colors: &[[u8; 3]]) -> Vec<u8> {
    let mut pdf = PdfBuilder::new();
    let ids: Vec<(String, ObjectId)> = colors
        .iter()
        .enumerate()
        .map(|(index, color)| {
            let samples: Vec<u8> = color.iter().copied().cycle().take(4 * 4 * 3).collect();
            (format!("Im{index:03}"), pdf.add_stream(rgb_image_stream(4, 4, &samples)))
        })
        .collect();
    let named: Vec<(&str, ObjectId)> = ids.iter().map(|(name, id)| (name.as_str(), *id)).collect();
    pdf.add_page(&named);
    pdf.build().expect("fixture pdf should serialize")
}
