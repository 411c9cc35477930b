use crate::types::*;

/// Effective settings of one endpoint, RFC 7540 defaults until a SETTINGS
/// frame says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `None` means the peer declared no limit.
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

/// What changed when a SETTINGS frame was applied; the caller propagates these
/// to the streams and the header codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettingsUpdate {
    /// `new - old` initial window size, added to every active stream's send
    /// window. May be negative.
    pub initial_window_delta: i32,
    pub header_table_size: Option<u32>,
}

impl Settings {
    /// Applies a SETTINGS payload in order. Validation per RFC 7540 §6.5.2.
    pub fn apply(&mut self, params: &[(SettingsParameter, u32)]) -> Result<SettingsUpdate, Error> {
        let old_window = self.initial_window_size;
        let old_table = self.header_table_size;
        for &(param, value) in params {
            match param {
                SettingsParameter::HeaderTableSize => self.header_table_size = value,
                SettingsParameter::EnablePush => {
                    self.enable_push = match value {
                        0 => false,
                        1 => true,
                        _ => return Err(Error::Protocol("ENABLE_PUSH must be 0 or 1")),
                    };
                }
                SettingsParameter::MaxConcurrentStreams => {
                    self.max_concurrent_streams = Some(value);
                }
                SettingsParameter::InitialWindowSize => {
                    if value > U31_MAX {
                        return Err(Error::FlowControl("initial window size above 2^31-1"));
                    }
                    self.initial_window_size = value;
                }
                SettingsParameter::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_CEILING).contains(&value) {
                        return Err(Error::Protocol("MAX_FRAME_SIZE out of range"));
                    }
                    self.max_frame_size = value;
                }
                SettingsParameter::MaxHeaderListSize => {
                    self.max_header_list_size = Some(value);
                }
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }
        Ok(SettingsUpdate {
            // both values fit in 31 bits, the difference fits in i32
            initial_window_delta: self.initial_window_size as i32 - old_window as i32,
            header_table_size: (self.header_table_size != old_table)
                .then(|| self.header_table_size),
        })
    }

    /// Wire form of the non-default parameters, for our outbound SETTINGS.
    pub fn to_params(&self) -> Vec<(SettingsParameter, u32)> {
        let defaults = Self::default();
        let mut params = Vec::new();
        if self.header_table_size != defaults.header_table_size {
            params.push((SettingsParameter::HeaderTableSize, self.header_table_size));
        }
        if self.enable_push != defaults.enable_push {
            params.push((SettingsParameter::EnablePush, u32::from(self.enable_push)));
        }
        if let Some(max) = self.max_concurrent_streams {
            params.push((SettingsParameter::MaxConcurrentStreams, max));
        }
        if self.initial_window_size != defaults.initial_window_size {
            params.push((SettingsParameter::InitialWindowSize, self.initial_window_size));
        }
        if self.max_frame_size != defaults.max_frame_size {
            params.push((SettingsParameter::MaxFrameSize, self.max_frame_size));
        }
        if let Some(max) = self.max_header_list_size {
            params.push((SettingsParameter::MaxHeaderListSize, max));
        }
        params
    }
}
