//! Synthetic images for tests.
//!
//! Every fixture is built in memory: pixel data comes from the `image`
//! encoders, metadata blocks are spliced in by hand so tests know exactly
//! which bytes are there.

use std::io::{Cursor, Write};
use std::ops::Range;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

use crate::metadata::ifd::{ByteOrder, TAG_EXIF_IFD, TAG_GPS_IFD, TAG_ICC, TAG_XMP};

pub const WIDTH: u32 = 8;
pub const HEIGHT: u32 = 6;

/// Stand-in for coded HEVC/AV1 data; never decoded.
pub const HEIF_IMAGE: &[u8] = b"\x12\x00\x0a\x0acoded image payload that nobody decodes";

fn pixels() -> RgbImage {
    RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        Rgb([(x * 30) as u8, (y * 40) as u8, ((x + y) * 15) as u8])
    })
}

fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

// ── metadata payloads ────────────────────────────────────────────────

/// A small v4.3 display profile with a `desc` tag.
pub fn icc_profile() -> Vec<u8> {
    let mut p = vec![0u8; 128];
    p[8] = 4;
    p[9] = 0x30;
    p[12..16].copy_from_slice(b"mntr");
    p[16..20].copy_from_slice(b"RGB ");
    p[20..24].copy_from_slice(b"XYZ ");
    p[36..40].copy_from_slice(b"acsp");
    p[80..84].copy_from_slice(b"TEST");

    let text = b"Test sRGB\0";
    let tag_offset = 128 + 4 + 12;
    let tag_size = 12 + text.len();
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend_from_slice(b"desc");
    p.extend_from_slice(&(tag_offset as u32).to_be_bytes());
    p.extend_from_slice(&(tag_size as u32).to_be_bytes());
    p.extend_from_slice(b"desc\0\0\0\0");
    p.extend_from_slice(&(text.len() as u32).to_be_bytes());
    p.extend_from_slice(text);
    while p.len() % 4 != 0 {
        p.push(0);
    }
    let len = p.len() as u32;
    p[0..4].copy_from_slice(&len.to_be_bytes());
    p
}

pub fn xmp_packet() -> String {
    concat!(
        "<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n",
        "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n",
        " <rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n",
        "  <rdf:Description rdf:about=\"\"\n",
        "    xmlns:xmp=\"http://ns.adobe.com/xap/1.0/\"\n",
        "    xmlns:dc=\"http://purl.org/dc/elements/1.1/\"\n",
        "    xmlns:photoshop=\"http://ns.adobe.com/photoshop/1.0/\"\n",
        "    xmlns:exif=\"http://ns.adobe.com/exif/1.0/\"\n",
        "    xmp:CreatorTool=\"TestEditor 1.0\"\n",
        "    photoshop:City=\"Pittsburgh\"\n",
        "    exif:GPSLatitude=\"40,26.7667N\">\n",
        "   <exif:GPSLongitude>79,58.9333W</exif:GPSLongitude>\n",
        "   <dc:creator><rdf:Seq><rdf:li>Jane Doe</rdf:li></rdf:Seq></dc:creator>\n",
        "   <dc:title><rdf:Alt><rdf:li xml:lang=\"x-default\">Sunset &amp; Sea</rdf:li></rdf:Alt></dc:title>\n",
        "  </rdf:Description>\n",
        " </rdf:RDF>\n",
        "</x:xmpmeta>\n",
        "<?xpacket end=\"w\"?>",
    )
    .to_string()
}

// ── TIFF structures ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Payload {
    Bytes(Vec<u8>),
    Short(Vec<u16>),
    Long(Vec<u32>),
    Rational(Vec<(u32, u32)>),
}

#[derive(Debug, Clone)]
pub struct TiffEntry {
    tag: u16,
    field_type: u16,
    payload: Payload,
}

impl TiffEntry {
    pub fn ascii(tag: u16, text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        Self {
            tag,
            field_type: 2,
            payload: Payload::Bytes(bytes),
        }
    }

    pub fn bytes(tag: u16, field_type: u16, bytes: &[u8]) -> Self {
        Self {
            tag,
            field_type,
            payload: Payload::Bytes(bytes.to_vec()),
        }
    }

    pub fn short(tag: u16, value: u16) -> Self {
        Self::shorts(tag, &[value])
    }

    pub fn shorts(tag: u16, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: 3,
            payload: Payload::Short(values.to_vec()),
        }
    }

    pub fn long(tag: u16, value: u32) -> Self {
        Self {
            tag,
            field_type: 4,
            payload: Payload::Long(vec![value]),
        }
    }

    pub fn rational(tag: u16, values: &[(u32, u32)]) -> Self {
        Self {
            tag,
            field_type: 5,
            payload: Payload::Rational(values.to_vec()),
        }
    }

    fn count(&self) -> u32 {
        match &self.payload {
            Payload::Bytes(b) => b.len() as u32,
            Payload::Short(v) => v.len() as u32,
            Payload::Long(v) => v.len() as u32,
            Payload::Rational(v) => v.len() as u32,
        }
    }

    fn encode(&self, order: ByteOrder) -> Vec<u8> {
        match &self.payload {
            Payload::Bytes(b) => b.clone(),
            Payload::Short(v) => v.iter().flat_map(|&x| order.encode_u16(x)).collect(),
            Payload::Long(v) => v.iter().flat_map(|&x| order.encode_u32(x)).collect(),
            Payload::Rational(v) => v
                .iter()
                .flat_map(|&(n, d)| [order.encode_u32(n), order.encode_u32(d)])
                .flatten()
                .collect(),
        }
    }
}

/// Builds classic TIFF structures: a main IFD chain with optional pixel
/// strips, plus Exif and GPS sub-directories.
pub struct TiffBuilder {
    order: ByteOrder,
    chain: Vec<Vec<TiffEntry>>,
    exif: Option<Vec<TiffEntry>>,
    gps: Option<Vec<TiffEntry>>,
    image: Option<RgbImage>,
}

const TAG_STRIP_OFFSETS: u16 = 0x0111;

impl TiffBuilder {
    pub fn new() -> Self {
        Self {
            order: ByteOrder::Little,
            chain: vec![Vec::new()],
            exif: None,
            gps: None,
            image: None,
        }
    }

    pub fn big_endian() -> Self {
        Self {
            order: ByteOrder::Big,
            ..Self::new()
        }
    }

    pub fn ifd0(mut self, entries: Vec<TiffEntry>) -> Self {
        self.chain[0].extend(entries);
        self
    }

    /// Another page in the main chain.
    pub fn page(mut self, entries: Vec<TiffEntry>) -> Self {
        self.chain.push(entries);
        self
    }

    pub fn exif(mut self, entries: Vec<TiffEntry>) -> Self {
        self.exif = Some(entries);
        self
    }

    pub fn gps(mut self, entries: Vec<TiffEntry>) -> Self {
        self.gps = Some(entries);
        self
    }

    /// Give every page an uncompressed RGB strip.
    pub fn image(mut self) -> Self {
        self.image = Some(pixels());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let order = self.order;
        let mut dirs = self.chain.clone();
        let strip = self.image.as_ref().map(|img| img.as_raw().clone());
        if let Some(img) = &self.image {
            for dir in &mut dirs {
                dir.extend([
                    TiffEntry::long(0x0100, img.width()),
                    TiffEntry::long(0x0101, img.height()),
                    TiffEntry::shorts(0x0102, &[8, 8, 8]),
                    TiffEntry::short(0x0103, 1),
                    TiffEntry::short(0x0106, 2),
                    TiffEntry::long(TAG_STRIP_OFFSETS, 0),
                    TiffEntry::short(0x0115, 3),
                    TiffEntry::long(0x0116, img.height()),
                    TiffEntry::long(0x0117, img.as_raw().len() as u32),
                    TiffEntry::short(0x011C, 1),
                ]);
            }
        }
        let pages = dirs.len();
        if self.exif.is_some() {
            dirs[0].push(TiffEntry::long(TAG_EXIF_IFD, 0));
        }
        if self.gps.is_some() {
            dirs[0].push(TiffEntry::long(TAG_GPS_IFD, 0));
        }
        let exif_index = self.exif.as_ref().map(|_| dirs.len());
        dirs.extend(self.exif.clone());
        let gps_index = self.gps.as_ref().map(|_| dirs.len());
        dirs.extend(self.gps.clone());
        for dir in &mut dirs {
            dir.sort_by_key(|e| e.tag);
        }

        // Lay out: header, each directory followed by its values, then strips.
        let dir_len = |dir: &[TiffEntry]| {
            let values: usize = dir
                .iter()
                .map(|e| e.encode(order).len())
                .filter(|&n| n > 4)
                .map(|n| n + n % 2)
                .sum();
            2 + dir.len() * 12 + 4 + values
        };
        let mut offsets = Vec::with_capacity(dirs.len());
        let mut pos = 8;
        for dir in &dirs {
            offsets.push(pos);
            pos += dir_len(dir);
        }
        let strip_offsets: Vec<usize> = (0..pages)
            .map(|_| {
                let at = pos;
                pos += strip.as_ref().map_or(0, Vec::len);
                at
            })
            .collect();

        for (i, dir) in dirs.iter_mut().enumerate() {
            for entry in dir.iter_mut() {
                let target = match entry.tag {
                    TAG_EXIF_IFD if i == 0 => exif_index.map(|x| offsets[x]),
                    TAG_GPS_IFD if i == 0 => gps_index.map(|x| offsets[x]),
                    TAG_STRIP_OFFSETS if i < pages => Some(strip_offsets[i]),
                    _ => None,
                };
                if let Some(target) = target {
                    entry.payload = Payload::Long(vec![target as u32]);
                }
            }
        }

        let mut out = Vec::with_capacity(pos);
        out.extend_from_slice(match order {
            ByteOrder::Little => b"II",
            ByteOrder::Big => b"MM",
        });
        out.extend_from_slice(&order.encode_u16(42));
        out.extend_from_slice(&order.encode_u32(8));

        for (i, dir) in dirs.iter().enumerate() {
            debug_assert_eq!(out.len(), offsets[i]);
            let next = if i + 1 < pages { offsets[i + 1] as u32 } else { 0 };
            let mut values_at = offsets[i] + 2 + dir.len() * 12 + 4;
            let mut values = Vec::new();
            out.extend_from_slice(&order.encode_u16(dir.len() as u16));
            for entry in dir {
                let bytes = entry.encode(order);
                out.extend_from_slice(&order.encode_u16(entry.tag));
                out.extend_from_slice(&order.encode_u16(entry.field_type));
                out.extend_from_slice(&order.encode_u32(entry.count()));
                if bytes.len() <= 4 {
                    let mut inline = bytes.clone();
                    inline.resize(4, 0);
                    out.extend_from_slice(&inline);
                } else {
                    out.extend_from_slice(&order.encode_u32(values_at as u32));
                    values.extend_from_slice(&bytes);
                    if bytes.len() % 2 == 1 {
                        values.push(0);
                    }
                    values_at += bytes.len() + bytes.len() % 2;
                }
            }
            out.extend_from_slice(&order.encode_u32(next));
            out.extend_from_slice(&values);
        }
        if let Some(strip) = &strip {
            for _ in 0..pages {
                out.extend_from_slice(strip);
            }
        }
        out
    }
}

fn gps_entries() -> Vec<TiffEntry> {
    vec![
        TiffEntry::bytes(0x0000, 1, &[2, 3, 0, 0]),
        TiffEntry::ascii(0x0001, "N"),
        TiffEntry::rational(0x0002, &[(40, 1), (26, 1), (46, 1)]),
        TiffEntry::ascii(0x0003, "W"),
        TiffEntry::rational(0x0004, &[(79, 1), (58, 1), (56, 1)]),
        TiffEntry::bytes(0x0005, 1, &[0]),
        TiffEntry::rational(0x0006, &[(2505, 10)]),
        TiffEntry::rational(0x0007, &[(14, 1), (30, 1), (5, 1)]),
        TiffEntry::ascii(0x001D, "2024:05:01"),
    ]
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().chain([0]).flat_map(u16::to_le_bytes).collect()
}

fn camera_entries() -> Vec<TiffEntry> {
    vec![
        TiffEntry::ascii(0x010F, "TestCam"),
        TiffEntry::ascii(0x0110, "TC-1"),
        TiffEntry::bytes(0x9C9B, 1, &utf16le("Holiday")),
    ]
}

fn exif_entries() -> Vec<TiffEntry> {
    vec![
        TiffEntry::rational(0x829A, &[(1, 125)]),
        TiffEntry::ascii(0x9003, "2024:05:01 14:30:05"),
    ]
}

/// EXIF with camera, shot and GPS data; TIFF-structured, no `Exif\0\0`.
pub fn exif_blob_with_gps() -> Vec<u8> {
    TiffBuilder::new()
        .ifd0(camera_entries())
        .exif(exif_entries())
        .gps(gps_entries())
        .build()
}

fn exif_app1() -> Vec<u8> {
    [b"Exif\0\0".to_vec(), exif_blob_with_gps()].concat()
}

// ── plain images ─────────────────────────────────────────────────────

pub fn plain_jpeg() -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(pixels()), ImageFormat::Jpeg)
}

pub fn plain_png() -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(pixels()), ImageFormat::Png)
}

pub fn plain_gif() -> Vec<u8> {
    encode(DynamicImage::ImageRgba8(DynamicImage::ImageRgb8(pixels()).to_rgba8()), ImageFormat::Gif)
}

pub fn rgba_png() -> Vec<u8> {
    let img = RgbaImage::from_fn(WIDTH, HEIGHT, |x, y| Rgba([(x * 30) as u8, (y * 40) as u8, 90, (x * 20) as u8]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

/// Looping GIF with `frames` differently shaded frames and a NETSCAPE block.
pub fn animated_gif(frames: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        let frames = (0..frames).map(|i| {
            let img = RgbaImage::from_fn(WIDTH, HEIGHT, |x, y| Rgba([(x * 30) as u8, (y * 40) as u8, (i * 60) as u8, 255]));
            Frame::from_parts(img, 0, 0, Delay::from_numer_denom_ms(100, 1))
        });
        encoder.encode_frames(frames).unwrap();
    }
    out
}

pub fn plain_webp() -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(pixels()), ImageFormat::WebP)
}

pub fn plain_bmp() -> Vec<u8> {
    encode(DynamicImage::ImageRgb8(pixels()), ImageFormat::Bmp)
}

pub fn plain_tiff() -> Vec<u8> {
    TiffBuilder::new().image().build()
}

pub fn plain_images() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("plain.jpg", plain_jpeg()),
        ("plain.png", plain_png()),
        ("plain.gif", plain_gif()),
        ("plain.webp", plain_webp()),
        ("plain.tif", plain_tiff()),
        ("plain.bmp", plain_bmp()),
        ("plain.heic", heif(b"heic", false, false)),
        ("plain.avif", heif(b"avif", false, false)),
    ]
}

/// A PNG cut off inside its image data.
pub fn truncated_png() -> Vec<u8> {
    let mut data = plain_png();
    data.truncate(data.len() - 20);
    data
}

// ── JPEG ─────────────────────────────────────────────────────────────

/// The plain JPEG with `(marker, contents)` segments inserted after SOI.
pub fn jpeg_with_segments(segments: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let plain = plain_jpeg();
    let mut out = plain[..2].to_vec();
    for (marker, contents) in segments {
        out.extend_from_slice(&[0xFF, *marker]);
        out.extend_from_slice(&((contents.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(contents);
    }
    out.extend_from_slice(&plain[2..]);
    out
}

pub fn tagged_jpeg() -> Vec<u8> {
    let icc = [b"ICC_PROFILE\0\x01\x01".to_vec(), icc_profile()].concat();
    let xmp = [b"http://ns.adobe.com/xap/1.0/\0".to_vec(), xmp_packet().into_bytes()].concat();
    jpeg_with_segments(&[
        (0xE1, exif_app1()),
        (0xE2, icc),
        (0xE1, xmp),
        (0xFE, b"shot on a test rig".to_vec()),
    ])
}

// ── PNG ──────────────────────────────────────────────────────────────

/// The plain PNG with chunks inserted after IHDR.
pub fn png_with_chunks(chunks: Vec<([u8; 4], Vec<u8>)>) -> Vec<u8> {
    let plain = plain_png();
    // signature + IHDR (length, type, 13 bytes, CRC)
    let ihdr_end = 8 + 25;
    let mut out = plain[..ihdr_end].to_vec();
    for (kind, contents) in chunks {
        let mut crc = flate2::Crc::new();
        crc.update(&kind);
        crc.update(&contents);
        out.extend_from_slice(&(contents.len() as u32).to_be_bytes());
        out.extend_from_slice(&kind);
        out.extend_from_slice(&contents);
        out.extend_from_slice(&crc.sum().to_be_bytes());
    }
    out.extend_from_slice(&plain[ihdr_end..]);
    out
}

pub fn tagged_png() -> Vec<u8> {
    let mut itxt = b"XML:com.adobe.xmp\0\0\0\0\0".to_vec();
    itxt.extend_from_slice(xmp_packet().as_bytes());
    png_with_chunks(vec![
        (*b"iCCP", [b"ICC Profile\0\0".to_vec(), zlib(&icc_profile())].concat()),
        (*b"eXIf", exif_blob_with_gps()),
        (*b"iTXt", itxt),
        (*b"tEXt", b"Comment\0shot on a test rig".to_vec()),
    ])
}

// ── GIF ──────────────────────────────────────────────────────────────

fn sub_blocks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in data.chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out.push(0);
    out
}

fn application_extension(id: &[u8; 11], body: &[u8]) -> Vec<u8> {
    [&[0x21, 0xFF, 11][..], id, body].concat()
}

/// The plain GIF with raw extension blocks inserted before the first frame.
pub fn gif_with_extensions(extensions: &[Vec<u8>]) -> Vec<u8> {
    let plain = plain_gif();
    let packed = plain[10];
    let table = if packed & 0x80 != 0 { 3 << ((packed & 0x07) + 1) } else { 0 };
    let at = 13 + table;
    let mut out = plain[..at].to_vec();
    for ext in extensions {
        out.extend_from_slice(ext);
    }
    out.extend_from_slice(&plain[at..]);
    out
}

pub fn tagged_gif() -> Vec<u8> {
    let comment = [&[0x21, 0xFE][..], &sub_blocks(b"shot on a test rig")].concat();
    let netscape = application_extension(b"NETSCAPE2.0", &[3, 1, 0, 0, 0]);
    // Raw packet followed by the 258-byte magic trailer.
    let mut xmp_body = xmp_packet().into_bytes();
    xmp_body.push(0x01);
    xmp_body.extend((0..=255u8).rev());
    xmp_body.push(0);
    let xmp = application_extension(b"XMP DataXMP", &xmp_body);
    let icc = application_extension(b"ICCRGBG1012", &sub_blocks(&icc_profile()));
    gif_with_extensions(&[comment, netscape, xmp, icc])
}

// ── WebP ─────────────────────────────────────────────────────────────

fn riff_chunk(id: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
    out
}

/// Extended WebP: VP8X, ICCP, the lossless bitstream, EXIF and XMP.
pub fn tagged_webp() -> Vec<u8> {
    let plain = plain_webp();
    // The simple-format file is RIFF header + a single VP8L chunk.
    let vp8l = &plain[12..];
    let mut vp8x = vec![0x20 | 0x08 | 0x04, 0, 0, 0];
    vp8x.extend_from_slice(&(WIDTH - 1).to_le_bytes()[..3]);
    vp8x.extend_from_slice(&(HEIGHT - 1).to_le_bytes()[..3]);

    let body = [
        riff_chunk(b"VP8X", &vp8x),
        riff_chunk(b"ICCP", &icc_profile()),
        vp8l.to_vec(),
        riff_chunk(b"EXIF", &exif_app1()),
        riff_chunk(b"XMP ", xmp_packet().as_bytes()),
    ]
    .concat();
    let mut out = b"RIFF".to_vec();
    out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    out.extend_from_slice(b"WEBP");
    out.extend_from_slice(&body);
    out
}

// ── TIFF ─────────────────────────────────────────────────────────────

pub fn tagged_tiff() -> Vec<u8> {
    TiffBuilder::new()
        .image()
        .ifd0(camera_entries())
        .ifd0(vec![
            TiffEntry::bytes(TAG_XMP, 1, xmp_packet().as_bytes()),
            TiffEntry::bytes(TAG_ICC, 7, &icc_profile()),
        ])
        .exif(exif_entries())
        .gps(gps_entries())
        .build()
}

pub fn two_page_tiff() -> Vec<u8> {
    TiffBuilder::new()
        .image()
        .ifd0(vec![TiffEntry::ascii(0x010F, "TestCam")])
        .page(vec![TiffEntry::ascii(0x013B, "Jane Doe")])
        .build()
}

/// An 8-bit greyscale BigTIFF with a Make tag.
pub fn bigtiff_gray() -> Vec<u8> {
    let pixels: Vec<u8> = (0..(WIDTH * HEIGHT)).map(|i| (i * 5) as u8).collect();
    let entries: [(u16, u16, u64, [u8; 8]); 10] = {
        let short = |v: u16| {
            let mut b = [0; 8];
            b[..2].copy_from_slice(&v.to_le_bytes());
            b
        };
        let long = |v: u32| {
            let mut b = [0; 8];
            b[..4].copy_from_slice(&v.to_le_bytes());
            b
        };
        let strip_at = 16 + 8 + 10 * 20 + 8;
        [
            (0x0100, 3, 1, short(WIDTH as u16)),
            (0x0101, 3, 1, short(HEIGHT as u16)),
            (0x0102, 3, 1, short(8)),
            (0x0103, 3, 1, short(1)),
            (0x0106, 3, 1, short(1)),
            (0x010F, 2, 8, *b"TestCam\0"),
            (0x0111, 4, 1, long(strip_at)),
            (0x0115, 3, 1, short(1)),
            (0x0116, 3, 1, short(HEIGHT as u16)),
            (0x0117, 4, 1, long(pixels.len() as u32)),
        ]
    };

    let mut out = b"II".to_vec();
    out.extend_from_slice(&43u16.to_le_bytes());
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&16u64.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (tag, field_type, count, value) in entries {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&field_type.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value);
    }
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&pixels);
    out
}

// ── BMP ──────────────────────────────────────────────────────────────

/// 24-bit BMP with a V5 header whose colour space is `cs_type` and whose
/// profile data (embedded bytes or a linked path) follows the pixels.
pub fn bmp_v5(cs_type: u32, profile: &[u8]) -> Vec<u8> {
    let img = pixels();
    let row = (WIDTH as usize * 3).div_ceil(4) * 4;
    let mut rows = Vec::with_capacity(row * HEIGHT as usize);
    for y in (0..HEIGHT).rev() {
        let start = rows.len();
        for x in 0..WIDTH {
            let [r, g, b] = img.get_pixel(x, y).0;
            rows.extend_from_slice(&[b, g, r]);
        }
        rows.resize(start + row, 0);
    }

    let mut dib = vec![0u8; 124];
    dib[0..4].copy_from_slice(&124u32.to_le_bytes());
    dib[4..8].copy_from_slice(&(WIDTH as i32).to_le_bytes());
    dib[8..12].copy_from_slice(&(HEIGHT as i32).to_le_bytes());
    dib[12..14].copy_from_slice(&1u16.to_le_bytes());
    dib[14..16].copy_from_slice(&24u16.to_le_bytes());
    dib[20..24].copy_from_slice(&(rows.len() as u32).to_le_bytes());
    dib[24..28].copy_from_slice(&2835u32.to_le_bytes());
    dib[28..32].copy_from_slice(&2835u32.to_le_bytes());
    dib[56..60].copy_from_slice(&cs_type.to_le_bytes());
    dib[108..112].copy_from_slice(&4u32.to_le_bytes());
    dib[112..116].copy_from_slice(&((124 + rows.len()) as u32).to_le_bytes());
    dib[116..120].copy_from_slice(&(profile.len() as u32).to_le_bytes());

    let total = 14 + dib.len() + rows.len() + profile.len();
    let mut out = b"BM".to_vec();
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&((14 + dib.len()) as u32).to_le_bytes());
    out.extend_from_slice(&dib);
    out.extend_from_slice(&rows);
    out.extend_from_slice(profile);
    out
}

// ── HEIF / AVIF ──────────────────────────────────────────────────────

/// An item of a synthetic HEIF file; `extent` is relative to the `mdat` body.
#[derive(Debug, Clone)]
pub struct HeifItem {
    kind: [u8; 4],
    content_type: &'static str,
    extent: Range<usize>,
}

impl HeifItem {
    pub fn image(offset: usize, len: usize) -> Self {
        Self {
            kind: *b"hvc1",
            content_type: "",
            extent: offset..offset + len,
        }
    }

    pub fn exif(offset: usize, len: usize) -> Self {
        Self {
            kind: *b"Exif",
            content_type: "",
            extent: offset..offset + len,
        }
    }

    pub fn xmp(offset: usize, len: usize) -> Self {
        Self {
            kind: *b"mime",
            content_type: "application/rdf+xml",
            extent: offset..offset + len,
        }
    }
}

fn isobmff(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full_box(kind: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
    isobmff(kind, &[&[version, 0, 0, 0][..], body].concat())
}

fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
    let compatible: &[&[u8; 4]] = if brand == b"avif" {
        &[b"avif", b"mif1", b"miaf"]
    } else {
        &[b"mif1", b"heic"]
    };
    let mut body = brand.to_vec();
    body.extend_from_slice(&0u32.to_be_bytes());
    for b in compatible {
        body.extend_from_slice(*b);
    }
    isobmff(b"ftyp", &body)
}

fn meta(items: &[HeifItem], mdat_body: usize, with_icc: bool) -> Vec<u8> {
    let hdlr = full_box(b"hdlr", 0, &[&[0; 4][..], b"pict", &[0; 12], b"\0"].concat());
    let pitm = full_box(b"pitm", 0, &1u16.to_be_bytes());

    let mut iinf = (items.len() as u16).to_be_bytes().to_vec();
    let mut iloc = vec![0x44, 0x00];
    iloc.extend_from_slice(&(items.len() as u16).to_be_bytes());
    for (i, item) in items.iter().enumerate() {
        let id = (i + 1) as u16;
        let mut infe = id.to_be_bytes().to_vec();
        infe.extend_from_slice(&[0, 0]);
        infe.extend_from_slice(&item.kind);
        infe.push(0);
        if &item.kind == b"mime" {
            infe.extend_from_slice(item.content_type.as_bytes());
            infe.push(0);
        }
        iinf.extend(full_box(b"infe", 2, &infe));

        iloc.extend_from_slice(&id.to_be_bytes());
        iloc.extend_from_slice(&0u16.to_be_bytes());
        iloc.extend_from_slice(&1u16.to_be_bytes());
        iloc.extend_from_slice(&((mdat_body + item.extent.start) as u32).to_be_bytes());
        iloc.extend_from_slice(&(item.extent.len() as u32).to_be_bytes());
    }

    let ispe = full_box(b"ispe", 0, &[WIDTH.to_be_bytes(), HEIGHT.to_be_bytes()].concat());
    let mut ipco = ispe;
    let mut associations = vec![0x81];
    if with_icc {
        ipco.extend(isobmff(b"colr", &[b"prof".to_vec(), icc_profile()].concat()));
        associations.push(0x02);
    }
    let mut ipma = 1u32.to_be_bytes().to_vec();
    ipma.extend_from_slice(&1u16.to_be_bytes());
    ipma.push(associations.len() as u8);
    ipma.extend_from_slice(&associations);
    let iprp = isobmff(b"iprp", &[isobmff(b"ipco", &ipco), full_box(b"ipma", 0, &ipma)].concat());

    full_box(
        b"meta",
        0,
        &[
            hdlr,
            pitm,
            full_box(b"iloc", 0, &iloc),
            full_box(b"iinf", 0, &iinf),
            iprp,
        ]
        .concat(),
    )
}

fn build_heif(brand: &[u8; 4], items: &[HeifItem], mdat: &[u8], with_icc: bool) -> Vec<u8> {
    let ftyp = ftyp(brand);
    // Box sizes do not depend on the offsets written into iloc.
    let meta_len = meta(items, 0, with_icc).len();
    let mdat_body = ftyp.len() + meta_len + 8;
    [ftyp, meta(items, mdat_body, with_icc), isobmff(b"mdat", mdat)].concat()
}

/// A HEIF (or AVIF, by brand) file with one coded image item and,
/// optionally, an Exif item and XMP plus an ICC `colr` property.
pub fn heif(brand: &[u8; 4], with_exif: bool, with_xmp_and_icc: bool) -> Vec<u8> {
    let mut items = vec![HeifItem::image(0, HEIF_IMAGE.len())];
    if brand == b"avif" {
        items[0].kind = *b"av01";
    }
    let mut mdat = HEIF_IMAGE.to_vec();
    if with_exif {
        // Offset to the TIFF header, then the APP1-style header.
        let payload = [6u32.to_be_bytes().to_vec(), exif_app1()].concat();
        items.push(HeifItem::exif(mdat.len(), payload.len()));
        mdat.extend(payload);
    }
    if with_xmp_and_icc {
        let packet = xmp_packet().into_bytes();
        items.push(HeifItem::xmp(mdat.len(), packet.len()));
        mdat.extend(packet);
    }
    build_heif(brand, &items, &mdat, with_xmp_and_icc)
}

/// A HEIF file with explicit items over an `mdat` holding [`HEIF_IMAGE`].
pub fn heif_with_items(brand: &[u8; 4], items: &[HeifItem]) -> Vec<u8> {
    build_heif(brand, items, HEIF_IMAGE, false)
}

/// A HEIF file whose Exif item has a zero extent length, so it runs to the
/// end of the file.
pub fn heif_with_open_ended_exif() -> Vec<u8> {
    let payload = [6u32.to_be_bytes().to_vec(), exif_app1()].concat();
    let items = [HeifItem::image(0, HEIF_IMAGE.len()), HeifItem::exif(HEIF_IMAGE.len(), 0)];
    build_heif(b"heic", &items, &[HEIF_IMAGE, &payload].concat(), false)
}

// ── batches ──────────────────────────────────────────────────────────

pub fn tagged_images() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("tagged.jpg", tagged_jpeg()),
        ("tagged.png", tagged_png()),
        ("tagged.webp", tagged_webp()),
        ("tagged.tif", tagged_tiff()),
        ("tagged.heic", heif(b"heic", true, true)),
        ("tagged.avif", heif(b"avif", true, true)),
    ]
}
