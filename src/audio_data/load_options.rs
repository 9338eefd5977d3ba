/// Defines how to handle channel conversion during audio loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertToMono {
    /// Keep original channels: stereo if input is stereo, mono if input is mono
    Original,
    /// Force mono: if input is stereo, average the channels
    ForceMono,
}

/// Whether a sound is decoded up front or streamed from disk while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// Let the loader decide from the container format.
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// How to handle mono conversion
    pub convert_to_mono: ConvertToMono,
    pub streaming: StreamingMode,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            convert_to_mono: ConvertToMono::Original,
            streaming: StreamingMode::Auto,
        }
    }
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert_to_mono(mut self, convert: ConvertToMono) -> Self {
        self.convert_to_mono = convert;
        self
    }

    pub fn streaming(mut self, mode: StreamingMode) -> Self {
        self.streaming = mode;
        self
    }
}
