//! RTSP decoding using FFmpeg.
//!
//! Demuxes over TCP and decodes to RGB24 in memory. Nothing is written to disk.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::time::Duration;

use super::rtsp::{DecodedFrame, StreamReader};
use super::SourceError;

struct FfmpegSession {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

pub(crate) struct FfmpegReader {
    url: String,
    stall_timeout: Duration,
    session: Option<FfmpegSession>,
}

impl FfmpegReader {
    pub(crate) fn new(url: String, stall_timeout: Duration) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self {
            url,
            stall_timeout,
            session: None,
        })
    }

    fn connect(&self) -> Result<FfmpegSession, SourceError> {
        let mut options = ffmpeg::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        options.set("timeout", &self.stall_timeout.as_micros().to_string());

        let input =
            ffmpeg::format::input_with_dictionary(&self.url, options).map_err(classify_error)?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| SourceError::Unavailable("stream has no video track".into()))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| SourceError::Unavailable(format!("load decoder parameters: {}", e)))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| SourceError::Unavailable(format!("open video decoder: {}", e)))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| SourceError::Unavailable(format!("create scaler: {}", e)))?;

        Ok(FfmpegSession {
            input,
            stream_index,
            decoder,
            scaler,
        })
    }
}

fn classify_error(error: ffmpeg::Error) -> SourceError {
    match error {
        ffmpeg::Error::HttpUnauthorized | ffmpeg::Error::HttpForbidden => {
            SourceError::Unauthorized(error.to_string())
        }
        ffmpeg::Error::HttpNotFound => SourceError::InvalidUrl(error.to_string()),
        other => SourceError::Unavailable(other.to_string()),
    }
}

impl StreamReader for FfmpegReader {
    fn open(&mut self) -> Result<(), SourceError> {
        self.session = None;
        self.session = Some(self.connect()?);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<DecodedFrame>, SourceError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SourceError::Unavailable("ffmpeg session is not open".into()))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if session.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                session
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .map_err(|e| SourceError::Decode(format!("scale frame to RGB: {}", e)))?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                return Ok(Some(DecodedFrame {
                    pixels,
                    width,
                    height,
                    arrival: None,
                }));
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut session.input) {
                Ok(()) => {
                    if packet.stream() != session.stream_index {
                        continue;
                    }
                    session
                        .decoder
                        .send_packet(&packet)
                        .map_err(|e| SourceError::Decode(e.to_string()))?;
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(classify_error(e)),
            }
        }
    }

    fn close(&mut self) {
        self.session = None;
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32), SourceError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| SourceError::Decode("ffmpeg frame row is out of bounds".into()))?,
        );
    }

    Ok((pixels, width, height))
}
