//! Frame source backed by a V4L2 camera
//!
//! Negotiates the first supported pixel format (MJPEG, YUYV, RGB3, BGR3 by
//! default), streams through memory-mapped buffers and converts every frame
//! to RGB.
//!
//! Performance notes:
//! - turbojpeg (libjpeg-turbo with SIMD) decodes MJPEG, jpeg-decoder is the fallback
//! - Integer-only YUYV to RGB conversion (no floating point)
//! - One conversion buffer reused for all frames

use anyhow::{Context, Result};
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::{CaptureFormat, VideoConfig};
use crate::vision::{Frame, FrameSource};

/// Thread-local turbojpeg decompressor for hardware-accelerated MJPEG decoding
thread_local! {
    static JPEG_DECOMPRESSOR: std::cell::RefCell<Option<turbojpeg::Decompressor>> =
        std::cell::RefCell::new(turbojpeg::Decompressor::new().ok());
}

/// Consecutive undecodable frames tolerated before the source gives up
const MAX_DECODE_FAILURES: u32 = 10;

/// Number of memory-mapped capture buffers
const BUFFER_COUNT: u32 = 4;

/// Pixel layouts the camera may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl PixelLayout {
    fn fourcc(self) -> FourCC {
        FourCC::new(match self {
            PixelLayout::Mjpeg => b"MJPG",
            PixelLayout::Yuyv => b"YUYV",
            PixelLayout::Rgb => b"RGB3",
            PixelLayout::Bgr => b"BGR3",
        })
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [
            PixelLayout::Mjpeg,
            PixelLayout::Yuyv,
            PixelLayout::Rgb,
            PixelLayout::Bgr,
        ]
        .into_iter()
        .find(|layout| layout.fourcc() == fourcc)
    }
}

/// Layouts in order of preference
fn preferred_layouts(format: CaptureFormat) -> [PixelLayout; 4] {
    match format {
        // Compressed MJPEG allows higher frame rates over USB
        CaptureFormat::Mjpeg => [
            PixelLayout::Mjpeg,
            PixelLayout::Yuyv,
            PixelLayout::Rgb,
            PixelLayout::Bgr,
        ],
        CaptureFormat::Yuyv => [
            PixelLayout::Yuyv,
            PixelLayout::Mjpeg,
            PixelLayout::Rgb,
            PixelLayout::Bgr,
        ],
    }
}

/// A V4L2 camera streaming RGB frames.
///
/// The device is held open for the lifetime of the value and released on drop.
pub struct V4lCamera {
    device_path: String,
    stream: Stream<'static>,
    // Kept after the stream so the device closes last
    _device: Device,
    layout: PixelLayout,
    width: u32,
    height: u32,
    read_timeout: Duration,
    rgb_buffer: Vec<u8>,
    frames_read: u64,
    decode_failures: u32,
}

impl V4lCamera {
    /// Open the configured device and start streaming
    pub fn open(config: &VideoConfig) -> Result<Self> {
        let path = config.input_device.as_str();
        info!("Opening camera {}", path);
        info!(
            "Requested resolution: {}x{} @ {} fps",
            config.width, config.height, config.fps
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open input device: {}", path))?;

        let caps = device
            .query_caps()
            .context("Failed to query device capabilities")?;
        info!("Camera: {} (driver: {})", caps.card, caps.driver);

        let format = configure_capture_format(&device, config)?;
        let layout = PixelLayout::from_fourcc(format.fourcc).with_context(|| {
            format!(
                "Unsupported pixel format {:?}",
                String::from_utf8_lossy(&format.fourcc.repr)
            )
        })?;
        info!(
            "Capture format: {}x{} {:?}",
            format.width, format.height, layout
        );

        if let Err(e) = set_frame_rate(&device, config.fps) {
            warn!("Could not set frame rate to {} fps: {}", config.fps, e);
        }

        if layout == PixelLayout::Mjpeg {
            // Warm up the decompressor outside the capture loop
            JPEG_DECOMPRESSOR.with(|_| {});
        }

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .context("Failed to create capture stream")?;
        // A stalled camera must not block the session forever
        let read_timeout = config.read_timeout();
        stream.set_timeout(read_timeout);

        Ok(Self {
            device_path: path.to_string(),
            stream,
            _device: device,
            layout,
            width: format.width,
            height: format.height,
            read_timeout,
            rgb_buffer: vec![0u8; format.width as usize * format.height as usize * 3],
            frames_read: 0,
            decode_failures: 0,
        })
    }
}

impl FrameSource for V4lCamera {
    fn read(&mut self) -> Option<Frame> {
        loop {
            let (w, h) = (self.width as usize, self.height as usize);

            // Blocks until the camera delivers a frame or the read times out
            let converted = match self.stream.next() {
                Ok((buf, _meta)) => convert(self.layout, buf, &mut self.rgb_buffer, w, h),
                Err(e) if is_stall(&e) => {
                    warn!(
                        "No frame from {} within {:?}, treating the camera as stalled",
                        self.device_path, self.read_timeout
                    );
                    return None;
                }
                Err(e) => {
                    warn!("Failed to capture frame: {}", e);
                    return None;
                }
            };

            if converted {
                self.decode_failures = 0;
                self.frames_read += 1;
                return Frame::from_raw(self.width, self.height, self.rgb_buffer.clone());
            }

            self.decode_failures += 1;
            debug!("Dropped undecodable {:?} frame", self.layout);
            if self.decode_failures >= MAX_DECODE_FAILURES {
                warn!(
                    "{} consecutive frames could not be decoded, giving up",
                    self.decode_failures
                );
                return None;
            }
        }
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        info!(
            "Releasing camera {} after {} frames",
            self.device_path, self.frames_read
        );
    }
}

/// Whether a capture error means the device delivered nothing in time
fn is_stall(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Convert one raw buffer into `rgb`; false when the buffer is unusable
fn convert(layout: PixelLayout, raw: &[u8], rgb: &mut [u8], width: usize, height: usize) -> bool {
    match layout {
        PixelLayout::Mjpeg => decode_mjpeg(raw, rgb, width, height),
        PixelLayout::Yuyv => {
            yuyv_to_rgb(raw, rgb, width, height);
            raw.len() >= width * height * 2
        }
        PixelLayout::Bgr => {
            bgr_to_rgb(raw, rgb);
            raw.len() >= rgb.len()
        }
        PixelLayout::Rgb => {
            let len = raw.len().min(rgb.len());
            rgb[..len].copy_from_slice(&raw[..len]);
            len == rgb.len()
        }
    }
}

/// Configure the capture format, trying preferred layouts in order
fn configure_capture_format(dev: &Device, config: &VideoConfig) -> Result<v4l::Format> {
    let (width, height) = (config.width, config.height);
    let formats = dev.enum_formats().context("Failed to enumerate formats")?;

    info!("Available formats:");
    for fmt in &formats {
        info!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for layout in preferred_layouts(config.format) {
        let fourcc = layout.fourcc();
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }
        info!("Trying format: {:?} at {}x{}", layout, width, height);

        let mut format = dev.format().context("Failed to get current format")?;
        format.width = width;
        format.height = height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) if actual.fourcc == fourcc => {
                info!("Successfully set format to {}x{} {:?}", actual.width, actual.height, layout);
                return Ok(actual);
            }
            Ok(actual) => warn!(
                "Device substituted {:?} for {:?}",
                String::from_utf8_lossy(&actual.fourcc.repr),
                layout
            ),
            Err(e) => warn!("Could not set format {:?} at {}x{}: {}", layout, width, height, e),
        }
    }

    // Fall back to whatever the device gives us
    let current = dev.format().context("Failed to get device format")?;
    info!(
        "Using device's current format: {}x{} {:?}",
        current.width,
        current.height,
        String::from_utf8_lossy(&current.fourcc.repr)
    );
    Ok(current)
}

/// Set the frame rate on the capture device
fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params().context("Failed to get parameters")?;
    params.interval = v4l::Fraction::new(1, fps.max(1));
    dev.set_params(&params).context("Failed to set parameters")?;

    let actual = dev.params().context("Failed to read back parameters")?;
    info!(
        "Frame interval: {}/{} ({:.1} fps, requested {})",
        actual.interval.numerator,
        actual.interval.denominator,
        actual.interval.denominator as f64 / actual.interval.numerator.max(1) as f64,
        fps
    );
    Ok(())
}

/// Decode an MJPEG frame into `rgb` with turbojpeg, falling back to the
/// software decoder. Frames of unexpected size are rejected.
fn decode_mjpeg(data: &[u8], rgb: &mut [u8], width: usize, height: usize) -> bool {
    let expected = width * height * 3;
    if rgb.len() < expected {
        return false;
    }

    let decoded = JPEG_DECOMPRESSOR.with(|decomp| {
        let mut decomp = decomp.borrow_mut();
        let Some(decompressor) = decomp.as_mut() else {
            return false;
        };
        let Ok(header) = decompressor.read_header(data) else {
            return false;
        };
        if header.width != width || header.height != height {
            return false;
        }

        let image = turbojpeg::Image {
            pixels: &mut rgb[..expected],
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(data, image).is_ok()
    });

    decoded || decode_mjpeg_software(data, rgb, width, height)
}

/// Software fallback MJPEG decoder using jpeg-decoder crate
fn decode_mjpeg_software(data: &[u8], rgb: &mut [u8], width: usize, height: usize) -> bool {
    let mut decoder = jpeg_decoder::Decoder::new(std::io::Cursor::new(data));
    let Ok(pixels) = decoder.decode() else {
        return false;
    };
    let Some(info) = decoder.info() else {
        return false;
    };
    if info.width as usize != width || info.height as usize != height {
        return false;
    }

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            let len = width * height * 3;
            rgb[..len].copy_from_slice(&pixels[..len]);
            true
        }
        jpeg_decoder::PixelFormat::L8 => {
            for (px, &gray) in rgb.chunks_exact_mut(3).zip(pixels.iter()) {
                px.fill(gray);
            }
            true
        }
        _ => false,
    }
}

/// Convert YUYV to RGB using fast integer math (no floating point)
/// Uses fixed-point arithmetic with 8-bit shift for BT.601 color conversion
#[inline]
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8], width: usize, height: usize) {
    let pairs = (width * height) / 2;

    // 4 bytes YUYV -> 2 RGB pixels
    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)).take(pairs) {
        let y0 = src[0] as i32;
        let u = src[1] as i32 - 128;
        let y1 = src[2] as i32;
        let v = src[3] as i32 - 128;

        // R = Y + 1.402 V, G = Y - 0.344 U - 0.714 V, B = Y + 1.772 U (scaled by 256)
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        let (first, second) = dst.split_at_mut(3);
        for (y, out) in [(y0, first), (y1, second)] {
            out[0] = (y + v_r).clamp(0, 255) as u8;
            out[1] = (y - uv_g).clamp(0, 255) as u8;
            out[2] = (y + u_b).clamp(0, 255) as u8;
        }
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (src, dst) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_counts_as_stall() {
        assert!(is_stall(&io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF")));
        assert!(!is_stall(&io::Error::new(io::ErrorKind::Other, "device unplugged")));
    }

    #[test]
    fn test_yuyv_to_rgb() {
        // Neutral chroma gives grey levels equal to luma
        let yuyv = [16u8, 128, 235, 128, 100, 128, 50, 128];
        let mut rgb = vec![0u8; 4 * 3];

        yuyv_to_rgb(&yuyv, &mut rgb, 2, 2);

        assert_eq!(&rgb[..3], &[16, 16, 16]);
        assert_eq!(&rgb[3..6], &[235, 235, 235]);
        assert_eq!(&rgb[9..], &[50, 50, 50]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let yuyv = [128u8, 128, 128, 255];
        let mut rgb = vec![0u8; 6];

        yuyv_to_rgb(&yuyv, &mut rgb, 2, 1);

        assert!(rgb[0] > 250);
        assert!(rgb[1] < 50);
    }

    #[test]
    fn test_bgr_to_rgb() {
        let bgr = vec![0u8, 128u8, 255u8]; // B=0, G=128, R=255
        let mut rgb = vec![0u8; 3];

        bgr_to_rgb(&bgr, &mut rgb);

        assert_eq!(rgb, vec![255, 128, 0]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut rgb = vec![0u8; 4 * 4 * 3];
        assert!(!decode_mjpeg(&[0xFF, 0xD8, 0x00, 0x01], &mut rgb, 4, 4));
    }

    #[test]
    fn test_decodes_encoded_jpeg() {
        use image::{ImageOutputFormat, Rgb, RgbImage};

        let src = RgbImage::from_pixel(16, 8, Rgb([200, 40, 40]));
        let mut jpeg = Vec::new();
        src.write_to(&mut std::io::Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(95))
            .unwrap();

        let mut rgb = vec![0u8; 16 * 8 * 3];
        assert!(decode_mjpeg(&jpeg, &mut rgb, 16, 8));
        assert!((rgb[0] as i32 - 200).abs() < 10);

        // Wrong dimensions are refused rather than copied partially
        let mut small = vec![0u8; 8 * 8 * 3];
        assert!(!decode_mjpeg(&jpeg, &mut small, 8, 8));
    }

    #[test]
    fn test_layout_preference_follows_config() {
        assert_eq!(preferred_layouts(CaptureFormat::Mjpeg)[0], PixelLayout::Mjpeg);
        assert_eq!(preferred_layouts(CaptureFormat::Yuyv)[0], PixelLayout::Yuyv);
        assert_eq!(PixelLayout::from_fourcc(FourCC::new(b"BGR3")), Some(PixelLayout::Bgr));
        assert_eq!(PixelLayout::from_fourcc(FourCC::new(b"NV12")), None);
    }
}
