use std::path::Path;
use std::sync::OnceLock;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use ffmpeg::util::frame::video::Video;
use ffmpeg::{codec, decoder, format, media, software, Rational};
use ffmpeg_next::{self as ffmpeg};
use image::codecs::jpeg;
use image::RgbImage;
use tracing::{debug, warn};

use crate::error::CaptionError;
use crate::sampling::{frame_indices, SamplingSpec};

const JPEG_QUALITY: u8 = 90;
const JPEG_MIME: &str = "image/jpeg";
const MICROS_PER_SECOND: f64 = 1_000_000.0;

static INIT: OnceLock<Result<(), ffmpeg::Error>> = OnceLock::new();

/// One encoded still image, ready to be inlined into a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FramePayload {
    pub(crate) mime: &'static str,
    pub(crate) data: Vec<u8>,
}

impl FramePayload {
    pub(crate) fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64_STANDARD.encode(&self.data))
    }
}

/// Encoded frames in sampling order. Frames that failed to decode are absent.
pub(crate) type FrameSet = Vec<FramePayload>;

/// An opened video. Dropping it releases the underlying decoder.
pub(crate) trait VideoSource {
    fn total_frames(&self) -> u64;

    /// Seek to `index` and decode a single frame as packed RGB.
    fn decode_frame(&mut self, index: u64) -> Result<RgbImage, CaptionError>;
}

pub(crate) trait VideoDecoder {
    type Source: VideoSource;

    fn open(&self, path: &Path) -> Result<Self::Source, CaptionError>;
}

/// Sample `spec.count` frames from the video at `path` and encode them as JPEG.
///
/// Indices that fail to decode or encode are skipped. An empty result is
/// reported as [`CaptionError::NoFramesExtracted`].
pub(crate) fn extract_frames<D: VideoDecoder>(
    decoder: &D,
    path: &Path,
    spec: SamplingSpec,
) -> Result<FrameSet, CaptionError> {
    let mut source = decoder.open(path)?;
    let total_frames = source.total_frames();
    let indices = frame_indices(total_frames, spec.count, spec.strategy);
    debug!(path = %path.display(), total_frames, ?indices, "sampling frames");

    let mut frames = Vec::with_capacity(indices.len());
    for index in indices {
        match source
            .decode_frame(index)
            .and_then(|image| encode_jpeg(&image))
        {
            Ok(frame) => frames.push(frame),
            Err(error) => warn!(path = %path.display(), index, %error, "skipping frame"),
        }
    }
    drop(source);

    if frames.is_empty() {
        return Err(CaptionError::NoFramesExtracted {
            path: path.to_path_buf(),
        });
    }
    Ok(frames)
}

fn encode_jpeg(image: &RgbImage) -> Result<FramePayload, CaptionError> {
    let mut jpeg_data = Vec::new();
    jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, JPEG_QUALITY).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(FramePayload {
        mime: JPEG_MIME,
        data: jpeg_data,
    })
}

/// Video decoding backed by the system FFmpeg libraries.
pub(crate) struct FfmpegDecoder;

impl FfmpegDecoder {
    pub(crate) fn new() -> Result<Self, ffmpeg::Error> {
        (*INIT.get_or_init(ffmpeg::init))?;
        Ok(Self)
    }
}

impl VideoDecoder for FfmpegDecoder {
    type Source = FfmpegSource;

    fn open(&self, path: &Path) -> Result<FfmpegSource, CaptionError> {
        let open_error = |reason: String| CaptionError::VideoOpen {
            path: path.to_path_buf(),
            reason,
        };

        let input = format::input(&path).map_err(|error| open_error(error.to_string()))?;
        let video_stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| open_error(ffmpeg::Error::StreamNotFound.to_string()))?;
        let stream_index = video_stream.index();
        let time_base = video_stream.time_base();
        let frames_per_second = rational_to_f64(video_stream.avg_frame_rate())
            .or_else(|| rational_to_f64(video_stream.rate()))
            .unwrap_or(0.0);
        // MPEG-TS and some mkv files start their clock above zero. Unknown or
        // negative starts count as zero.
        let start_time = video_stream.start_time().max(0);

        // Containers without a frame count fall back to duration * rate.
        let total_frames = match video_stream.frames() {
            frames if frames > 0 => frames as u64,
            _ if frames_per_second > 0.0 && input.duration() > 0 => {
                (input.duration() as f64 / MICROS_PER_SECOND * frames_per_second) as u64
            }
            _ => 0,
        };

        let decoder = codec::context::Context::from_parameters(video_stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(|error| open_error(error.to_string()))?;
        let scaler = software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            software::scaling::Flags::BILINEAR,
        )
        .map_err(|error| open_error(error.to_string()))?;

        Ok(FfmpegSource {
            input,
            stream_index,
            decoder,
            scaler,
            time_base,
            start_time,
            frames_per_second,
            total_frames,
        })
    }
}

pub(crate) struct FfmpegSource {
    input: format::context::Input,
    stream_index: usize,
    decoder: decoder::Video,
    scaler: software::scaling::context::Context,
    time_base: Rational,
    /// First presentation timestamp, in `time_base` units.
    start_time: i64,
    frames_per_second: f64,
    total_frames: u64,
}

impl VideoSource for FfmpegSource {
    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn decode_frame(&mut self, index: u64) -> Result<RgbImage, CaptionError> {
        let position = seek_position(
            index,
            self.frames_per_second,
            stream_seconds(self.start_time, self.time_base),
        );
        // Lands on the keyframe at or before the target; decode forward from there.
        self.input.seek(position, ..position).map_err(decode_error)?;
        self.decoder.flush();

        let mut decoded = Video::empty();
        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder.send_packet(&packet).map_err(decode_error)?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                if reached(
                    &decoded,
                    index,
                    self.start_time,
                    self.time_base,
                    self.frames_per_second,
                ) {
                    return to_rgb_image(&mut self.scaler, &decoded);
                }
            }
        }

        self.decoder.send_eof().map_err(decode_error)?;
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            if reached(
                &decoded,
                index,
                self.start_time,
                self.time_base,
                self.frames_per_second,
            ) {
                return to_rgb_image(&mut self.scaler, &decoded);
            }
        }

        Err(CaptionError::FrameDecode(format!(
            "frame {index} not found in video stream"
        )))
    }
}

fn decode_error(error: ffmpeg::Error) -> CaptionError {
    CaptionError::FrameDecode(error.to_string())
}

fn rational_to_f64(rational: Rational) -> Option<f64> {
    (rational.numerator() > 0 && rational.denominator() > 0)
        .then(|| f64::from(rational.numerator()) / f64::from(rational.denominator()))
}

fn stream_seconds(timestamp: i64, time_base: Rational) -> f64 {
    timestamp as f64 * f64::from(time_base.numerator()) / f64::from(time_base.denominator())
}

/// Container seek target for frame `index`, in microseconds.
fn seek_position(index: u64, frames_per_second: f64, start_seconds: f64) -> i64 {
    let offset = if frames_per_second > 0.0 {
        index as f64 / frames_per_second
    } else {
        0.0
    };
    ((start_seconds + offset) * MICROS_PER_SECOND) as i64
}

/// Frame index of a timestamp, counted from the stream's first frame.
fn frame_number(timestamp: i64, start_time: i64, time_base: Rational, frames_per_second: f64) -> u64 {
    let seconds = stream_seconds(timestamp - start_time, time_base);
    (seconds * frames_per_second).round().max(0.0) as u64
}

/// Whether a decoded frame sits at or past the target index.
fn reached(
    decoded: &Video,
    index: u64,
    start_time: i64,
    time_base: Rational,
    frames_per_second: f64,
) -> bool {
    decoded.timestamp().map_or(true, |timestamp| {
        frame_number(timestamp, start_time, time_base, frames_per_second) >= index
    })
}

fn to_rgb_image(
    scaler: &mut software::scaling::context::Context,
    decoded: &Video,
) -> Result<RgbImage, CaptionError> {
    let mut frame = Video::empty();
    scaler.run(decoded, &mut frame).map_err(decode_error)?;

    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    // Rows may carry padding beyond width * 3.
    let buffer = if stride == row_bytes {
        data[..row_bytes * height as usize].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            buffer.extend_from_slice(&data[start..start + row_bytes]);
        }
        buffer
    };

    RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
        CaptionError::FrameDecode("decoded frame does not fit an RGB image buffer".to_owned())
    })
}
