//! # Bridge wire protocol
//!
//! Little-endian, 32-bit integers throughout.
//!
//! Client → server traffic is written raw: a command id, then the
//! command's fields (records as their Pod bytes, images as a five-field
//! header plus the pixel payload). Server → client traffic is framed:
//! every response field is a `u32` length followed by the payload, and
//! the client validates each frame against the size it expects, so a
//! desynchronised stream is caught at the first frame rather than
//! corrupting a larger read.
//!
//! ## Commands
//!
//! | id | command    | payload                                   |
//! |----|------------|-------------------------------------------|
//! | 1  | `START`    | settings, options, image, mask            |
//! | 2  | `GET_STATE`| —                                         |
//! | 3  | `GET_RESULT`| — (only legal once finished)             |
//! | 4  | `RESET`    | —                                         |
//! | 5  | `SHUTDOWN` | —                                         |
//!
//! ## Responses
//!
//! `OK` (1) echoes the command id it answers, then command-specific
//! frames. `ERROR` (2) carries one UTF-8 message frame and is fatal: the
//! server exits after sending it. `STATE_CHANGED` (3) is unsolicited and
//! tells the client to issue `GET_STATE`.

use std::io::{self, Read, Write};

use aniso_pix::IntImage;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytemuck::{Pod, Zeroable};

use crate::config::{DisplayMode, Interpolation, Options, Settings};
use crate::error::EngineError;

pub const CMD_START: i32 = 1;
pub const CMD_GET_STATE: i32 = 2;
pub const CMD_GET_RESULT: i32 = 3;
pub const CMD_RESET: i32 = 4;
pub const CMD_SHUTDOWN: i32 = 5;

pub const RESP_OK: i32 = 1;
pub const RESP_ERROR: i32 = 2;
pub const RESP_STATE_CHANGED: i32 = 3;

/// Sanity bound on variable-length frames (error messages); anything
/// larger is a desynchronised stream, not a message.
const MAX_MESSAGE_FRAME: u32 = 1 << 20;

/// Bit-copyable transport form of [`Settings`].
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct WireSettings {
    pub input_scale: f32,
    pub pre_blur: f32,
    pub amplitude: f32,
    pub sharpness: f32,
    pub anisotropy: f32,
    pub alpha: f32,
    pub sigma: f32,
    pub gfact: f32,
    pub dl: f32,
    pub da: f32,
    pub gauss_prec: f32,
    pub interpolation: u32,
    pub partial_stage_output: i32,
    pub iterations: i32,
    pub fast_approx: u32,
    pub alt_amplitude: u32,
}

impl From<&Settings> for WireSettings {
    fn from(s: &Settings) -> Self {
        Self {
            input_scale: s.input_scale,
            pre_blur: s.pre_blur,
            amplitude: s.amplitude,
            sharpness: s.sharpness,
            anisotropy: s.anisotropy,
            alpha: s.alpha,
            sigma: s.sigma,
            gfact: s.gfact,
            dl: s.dl,
            da: s.da,
            gauss_prec: s.gauss_prec,
            interpolation: s.interpolation.as_u32(),
            partial_stage_output: s.partial_stage_output,
            iterations: s.iterations,
            fast_approx: s.fast_approx as u32,
            alt_amplitude: s.alt_amplitude as u32,
        }
    }
}

impl WireSettings {
    pub fn to_settings(&self) -> Settings {
        Settings {
            input_scale: self.input_scale,
            pre_blur: self.pre_blur,
            amplitude: self.amplitude,
            sharpness: self.sharpness,
            anisotropy: self.anisotropy,
            alpha: self.alpha,
            sigma: self.sigma,
            gfact: self.gfact,
            dl: self.dl,
            da: self.da,
            gauss_prec: self.gauss_prec,
            interpolation: Interpolation::from_u32(self.interpolation),
            partial_stage_output: self.partial_stage_output,
            iterations: self.iterations,
            fast_approx: self.fast_approx != 0,
            alt_amplitude: self.alt_amplitude != 0,
        }
    }
}

/// Bit-copyable transport form of [`Options`].
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct WireOptions {
    pub threads: i32,
    pub gpu: u32,
    pub display_mode: u32,
    pub block_pixel_limit: u32,
}

impl From<&Options> for WireOptions {
    fn from(o: &Options) -> Self {
        Self {
            threads: o.threads,
            gpu: o.gpu as u32,
            display_mode: o.display_mode.as_u32(),
            block_pixel_limit: o.block_pixel_limit,
        }
    }
}

impl WireOptions {
    pub fn to_options(&self) -> Options {
        Options {
            threads: self.threads,
            gpu: self.gpu != 0,
            display_mode: DisplayMode::from_u32(self.display_mode),
            block_pixel_limit: self.block_pixel_limit,
        }
    }
}

// ---- raw (client → server) direction ----

pub fn write_raw_i32<W: Write>(w: &mut W, value: i32) -> io::Result<()> {
    w.write_i32::<LittleEndian>(value)
}

pub fn read_raw_i32<R: Read + ?Sized>(r: &mut R) -> io::Result<i32> {
    r.read_i32::<LittleEndian>()
}

pub fn write_record<W: Write, T: Pod>(w: &mut W, record: &T) -> io::Result<()> {
    w.write_all(bytemuck::bytes_of(record))
}

pub fn read_record<R: Read + ?Sized, T: Pod + Zeroable>(r: &mut R) -> io::Result<T> {
    let mut record = T::zeroed();
    r.read_exact(bytemuck::bytes_of_mut(&mut record))?;
    Ok(record)
}

/// Header quintuple plus pixel payload, raw. An empty image writes a
/// zeroed header and no pixels.
pub fn write_image_raw<W: Write>(w: &mut W, img: &IntImage) -> io::Result<()> {
    write_raw_i32(w, img.width() as i32)?;
    write_raw_i32(w, img.height() as i32)?;
    write_raw_i32(w, img.stride_bytes() as i32)?;
    write_raw_i32(w, img.bytes_per_channel() as i32)?;
    write_raw_i32(w, img.channels() as i32)?;
    w.write_all(img.bytes())
}

/// Serialised form of "no image": the zero-size single-channel header.
pub fn write_no_image_raw<W: Write>(w: &mut W) -> io::Result<()> {
    for v in [0, 0, 0, 1, 1] {
        write_raw_i32(w, v)?;
    }
    Ok(())
}

pub fn read_image_raw<R: Read + ?Sized>(r: &mut R) -> Result<IntImage, EngineError> {
    let width = read_raw_i32(r).map_err(read_failed)?;
    let height = read_raw_i32(r).map_err(read_failed)?;
    let stride_bytes = read_raw_i32(r).map_err(read_failed)?;
    let bytes_per_channel = read_raw_i32(r).map_err(read_failed)?;
    let channels = read_raw_i32(r).map_err(read_failed)?;

    if width < 0 || height < 0 || stride_bytes < 0 || channels < 0 {
        return Err(EngineError::Protocol(format!(
            "malformed image header {}x{} stride {} channels {}",
            width, height, stride_bytes, channels
        )));
    }
    let len = height as usize * stride_bytes as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).map_err(read_failed)?;

    IntImage::from_vec(
        data,
        width as usize,
        height as usize,
        bytes_per_channel as usize,
        channels as usize,
        stride_bytes as usize,
    )
    .map_err(|e| EngineError::Protocol(e.to_string()))
}

// ---- framed (server → client) direction ----

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(payload.len() as u32)?;
    w.write_all(payload)
}

pub fn write_frame_i32<W: Write>(w: &mut W, value: i32) -> io::Result<()> {
    write_frame(w, &value.to_le_bytes())
}

/// Read a frame into `buf`, validating the advertised length matches
/// exactly what the caller expects.
pub fn read_frame_exact<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<(), EngineError> {
    let len = r.read_u32::<LittleEndian>().map_err(read_failed)?;
    if len as usize != buf.len() {
        return Err(EngineError::Protocol(format!(
            "expected a {}-byte frame, got {}",
            buf.len(),
            len
        )));
    }
    r.read_exact(buf).map_err(read_failed)
}

pub fn read_frame_i32<R: Read + ?Sized>(r: &mut R) -> Result<i32, EngineError> {
    let mut buf = [0u8; 4];
    read_frame_exact(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_frame_f32<R: Read + ?Sized>(r: &mut R) -> Result<f32, EngineError> {
    let mut buf = [0u8; 4];
    read_frame_exact(r, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub fn read_frame_bool<R: Read + ?Sized>(r: &mut R) -> Result<bool, EngineError> {
    let mut buf = [0u8; 1];
    read_frame_exact(r, &mut buf)?;
    Ok(buf[0] != 0)
}

/// Read a variable-length frame (the error message path).
pub fn read_frame_var<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>, EngineError> {
    let len = r.read_u32::<LittleEndian>().map_err(read_failed)?;
    if len > MAX_MESSAGE_FRAME {
        return Err(EngineError::Protocol(format!("unreasonable frame length {}", len)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(read_failed)?;
    Ok(buf)
}

// ---- response helpers (server side) ----

pub fn write_ok<W: Write>(w: &mut W, command: i32) -> io::Result<()> {
    write_frame_i32(w, RESP_OK)?;
    write_frame_i32(w, command)
}

pub fn write_error<W: Write>(w: &mut W, message: &str) -> io::Result<()> {
    write_frame_i32(w, RESP_ERROR)?;
    write_frame(w, message.as_bytes())
}

pub fn write_state_changed<W: Write>(w: &mut W) -> io::Result<()> {
    write_frame_i32(w, RESP_STATE_CHANGED)
}

/// Classify a failed read: a vanished peer is a worker crash, everything
/// else is protocol trouble.
pub fn read_failed(e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => {
            EngineError::Worker("connection closed mid-read".to_string())
        }
        io::ErrorKind::TimedOut => EngineError::Protocol("read timed out".to_string()),
        _ => EngineError::Protocol(format!("read failed: {}", e)),
    }
}

/// Same classification for the write direction.
pub fn write_failed(e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::BrokenPipe => EngineError::Worker("connection closed mid-write".to_string()),
        io::ErrorKind::TimedOut => EngineError::Protocol("write timed out".to_string()),
        _ => EngineError::Protocol(format!("write failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn settings_record_roundtrips_bit_exactly() {
        let mut s = Settings::default();
        s.amplitude = 40.0;
        s.interpolation = Interpolation::RungeKutta;
        s.fast_approx = false;
        let mut buf = Vec::new();
        write_record(&mut buf, &WireSettings::from(&s)).unwrap();
        assert_eq!(buf.len(), std::mem::size_of::<WireSettings>());
        let back: WireSettings = read_record(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.to_settings(), s);
    }

    #[test]
    fn options_record_roundtrips() {
        let o = Options {
            threads: -2,
            gpu: true,
            display_mode: DisplayMode::SideBySide,
            block_pixel_limit: 100_000,
        };
        let mut buf = Vec::new();
        write_record(&mut buf, &WireOptions::from(&o)).unwrap();
        let back: WireOptions = read_record(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.to_options(), o);
    }

    #[test]
    fn image_roundtrips_with_stride_padding() {
        let mut img = IntImage::alloc_with_stride(3, 2, 1, 3, 12).unwrap();
        for (i, b) in img.bytes_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut buf = Vec::new();
        write_image_raw(&mut buf, &img).unwrap();
        let back = read_image_raw(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.width(), 3);
        assert_eq!(back.stride_bytes(), 12);
        assert_eq!(back.bytes(), img.bytes());
    }

    #[test]
    fn empty_image_roundtrips() {
        let mut buf = Vec::new();
        write_no_image_raw(&mut buf).unwrap();
        let back = read_image_raw(&mut Cursor::new(&buf)).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn frame_length_mismatch_is_a_protocol_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        let err = read_frame_exact(&mut Cursor::new(&buf), &mut out).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn truncated_stream_reads_as_worker_crash() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0u8; 16]).unwrap();
        buf.truncate(7);
        let mut out = [0u8; 16];
        let err = read_frame_exact(&mut Cursor::new(&buf), &mut out).unwrap_err();
        assert!(matches!(err, EngineError::Worker(_)));
    }

    #[test]
    fn response_helpers_frame_as_documented() {
        let mut buf = Vec::new();
        write_ok(&mut buf, CMD_GET_STATE).unwrap();
        write_error(&mut buf, "boom").unwrap();
        write_state_changed(&mut buf).unwrap();

        let mut r = Cursor::new(&buf);
        assert_eq!(read_frame_i32(&mut r).unwrap(), RESP_OK);
        assert_eq!(read_frame_i32(&mut r).unwrap(), CMD_GET_STATE);
        assert_eq!(read_frame_i32(&mut r).unwrap(), RESP_ERROR);
        assert_eq!(read_frame_var(&mut r).unwrap(), b"boom");
        assert_eq!(read_frame_i32(&mut r).unwrap(), RESP_STATE_CHANGED);
    }
}
