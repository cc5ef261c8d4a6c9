use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt::Display;

pub type DimSize = u32;
pub type Shape = SmallVec<[DimSize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Dtype {
    Uint8,
    Sint32,
    Float32,
}

/// Static description of a single `Conv2DNchwFchw`-layout convolution.
///
/// Input and output are (batch, channel, height, width); the filter is
/// (out-channel, in-channel, filter-height, filter-width). All extents are
/// known at transformation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConvolutionDescriptor {
    pub batch: DimSize,
    pub in_channels: DimSize,
    pub out_channels: DimSize,
    pub out_height: DimSize,
    pub out_width: DimSize,
    pub filter_height: DimSize,
    pub filter_width: DimSize,
    pub strides: (DimSize, DimSize),
    pub dilations: (DimSize, DimSize),
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match &self {
            Dtype::Uint8 => 1,
            Dtype::Sint32 | Dtype::Float32 => 4,
        }
    }

    pub fn is_integral(&self) -> bool {
        !matches!(self, Dtype::Float32)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

impl ConvolutionDescriptor {
    pub fn input_height(&self) -> DimSize {
        (self.out_height - 1) * self.strides.0 + self.filter_height
    }

    pub fn input_width(&self) -> DimSize {
        (self.out_width - 1) * self.strides.1 + self.filter_width
    }

    pub fn input_shape(&self) -> Shape {
        smallvec![
            self.batch,
            self.in_channels,
            self.input_height(),
            self.input_width()
        ]
    }

    pub fn filter_shape(&self) -> Shape {
        smallvec![
            self.out_channels,
            self.in_channels,
            self.filter_height,
            self.filter_width
        ]
    }

    pub fn output_shape(&self) -> Shape {
        smallvec![
            self.batch,
            self.out_channels,
            self.out_height,
            self.out_width
        ]
    }

    /// The number of output pixels, i.e. the extent of the flattened window
    /// dimension after lowering.
    pub fn window_count(&self) -> DimSize {
        self.out_height * self.out_width
    }
}
