//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5.1).
//!
//! A SETTINGS frame only carries the parameters the sender wants to change,
//! so frames decode into a list of [`Setting`] values which are validated up
//! front and then applied to a [`Settings`] snapshot in one step.

use bytes::BufMut;

use crate::error::H2Error;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Largest legal window size (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
/// Smallest legal SETTINGS_MAX_FRAME_SIZE.
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;
/// Largest legal SETTINGS_MAX_FRAME_SIZE (2^24 - 1).
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// One validated SETTINGS parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    /// Unknown identifiers are carried but ignored (RFC 7540 Section 6.5.2).
    Unknown(u16, u32),
}

impl Setting {
    /// Validate a raw (id, value) pair.
    pub fn from_wire(id: u16, value: u32) -> Result<Self, H2Error> {
        Ok(match id {
            SETTINGS_HEADER_TABLE_SIZE => Self::HeaderTableSize(value),
            SETTINGS_ENABLE_PUSH => match value {
                0 => Self::EnablePush(false),
                1 => Self::EnablePush(true),
                _ => {
                    return Err(H2Error::ProtocolError("ENABLE_PUSH must be 0 or 1".into()));
                }
            },
            SETTINGS_MAX_CONCURRENT_STREAMS => Self::MaxConcurrentStreams(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(H2Error::FlowControlError);
                }
                Self::InitialWindowSize(value)
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                    return Err(H2Error::ProtocolError("MAX_FRAME_SIZE out of range".into()));
                }
                Self::MaxFrameSize(value)
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => Self::MaxHeaderListSize(value),
            other => Self::Unknown(other, value),
        })
    }

    fn to_wire(self) -> (u16, u32) {
        match self {
            Self::HeaderTableSize(v) => (SETTINGS_HEADER_TABLE_SIZE, v),
            Self::EnablePush(v) => (SETTINGS_ENABLE_PUSH, u32::from(v)),
            Self::MaxConcurrentStreams(v) => (SETTINGS_MAX_CONCURRENT_STREAMS, v),
            Self::InitialWindowSize(v) => (SETTINGS_INITIAL_WINDOW_SIZE, v),
            Self::MaxFrameSize(v) => (SETTINGS_MAX_FRAME_SIZE, v),
            Self::MaxHeaderListSize(v) => (SETTINGS_MAX_HEADER_LIST_SIZE, v),
            Self::Unknown(id, v) => (id, v),
        }
    }
}

/// Encode parameters as 6-byte (id: u16, value: u32) pairs.
pub fn encode_params(params: &[Setting], buf: &mut impl BufMut) {
    for param in params {
        let (id, value) = param.to_wire();
        buf.put_u16(id);
        buf.put_u32(value);
    }
}

/// Decode and validate a SETTINGS payload.
///
/// Either every parameter is valid and the whole list is returned, or the
/// first invalid one produces an error and nothing is applied.
pub fn decode_params(payload: &[u8]) -> Result<Vec<Setting>, H2Error> {
    if !payload.len().is_multiple_of(6) {
        return Err(H2Error::FrameSizeError);
    }
    payload
        .chunks_exact(6)
        .map(|pair| {
            let id = u16::from_be_bytes([pair[0], pair[1]]);
            let value = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);
            Setting::from_wire(id, value)
        })
        .collect()
}

/// Connection-scoped SETTINGS state for one side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1). Default 4096. Advisory only: the
    /// header block codec keeps no table.
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2). Default 1 (enabled).
    pub enable_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3). Default unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4). Default 65535.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5). Default 16384.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6). Default unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65535,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Client defaults: push disabled (ENABLE_PUSH=0).
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            ..Default::default()
        }
    }

    /// The parameters a SETTINGS frame announcing these values carries.
    pub fn params(&self) -> Vec<Setting> {
        let mut params = vec![
            Setting::HeaderTableSize(self.header_table_size),
            Setting::EnablePush(self.enable_push),
        ];
        if let Some(v) = self.max_concurrent_streams {
            params.push(Setting::MaxConcurrentStreams(v));
        }
        params.push(Setting::InitialWindowSize(self.initial_window_size));
        params.push(Setting::MaxFrameSize(self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            params.push(Setting::MaxHeaderListSize(v));
        }
        params
    }

    /// Check that locally configured values are legal to announce.
    pub fn validate(&self) -> Result<(), H2Error> {
        for param in self.params() {
            let (id, value) = param.to_wire();
            Setting::from_wire(id, value)?;
        }
        Ok(())
    }

    /// Apply already-validated parameters, in order.
    ///
    /// Returns the change in SETTINGS_INITIAL_WINDOW_SIZE so the caller can
    /// adjust open stream windows (RFC 7540 Section 6.9.2).
    pub fn apply(&mut self, params: &[Setting]) -> i64 {
        let old_window = i64::from(self.initial_window_size);
        for param in params {
            match *param {
                Setting::HeaderTableSize(v) => self.header_table_size = v,
                Setting::EnablePush(v) => self.enable_push = v,
                Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
                Setting::InitialWindowSize(v) => self.initial_window_size = v,
                Setting::MaxFrameSize(v) => self.max_frame_size = v,
                Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
                Setting::Unknown(..) => {}
            }
        }
        i64::from(self.initial_window_size) - old_window
    }
}
