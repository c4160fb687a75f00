//! Little-endian binary encoding of the arguments stored in a resource record.
//! Lengths are `u32` prefixes. Native enums and flags are stored as their raw
//! values, native handles as raw `u64`.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use ash::vk;
use ash::vk::Handle;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use crate::renderer::contexts::resource_ctx::descriptor_set::{BufferBinding, ImageBinding};
use crate::renderer::contexts::resource_ctx::record::ResourceType;
use crate::renderer::contexts::resource_ctx::resource_type::{ShaderResourceMode, ShaderResourceType};
use crate::renderer::resources::framebuffer::RenderTarget;
use crate::renderer::resources::pipeline::{
    ColorBlendAttachmentState, ColorBlendState, DepthStencilState, InputAssemblyState,
    MultisampleState, RasterizationState, StencilOpState, VertexInputAttribute,
    VertexInputBinding, VertexInputState, ViewportState,
};
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, SubpassInfo};
use crate::renderer::resources::shader::{ShaderResource, ShaderSource, ShaderVariant};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record stream ends in the middle of an entry")]
    Truncated,
    #[error("Unknown resource tag {0}")]
    UnknownTag(u8),
    #[error("{ty:?} index {index} does not refer to an earlier entry")]
    UnresolvedIndex { ty: ResourceType, index: u32 },
    #[error("Record string is not valid UTF-8")]
    InvalidUtf8,
    #[error("Invalid {what} value {value}")]
    InvalidValue { what: &'static str, value: u64 },
    #[error("Record I/O failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for RecordError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            _ => Self::Io(error),
        }
    }
}

pub trait RecordCodec: Sized {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()>;
    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError>;
}

fn remaining(input: &Cursor<&[u8]>) -> u64 {
    (input.get_ref().len() as u64).saturating_sub(input.position())
}

fn encode_len(len: usize, out: &mut Vec<u8>) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record length exceeds u32"))?;
    out.write_u32::<LittleEndian>(len)
}

/// Every encoded element takes at least one byte, so a length larger than
/// what is left can only come from a cut stream.
fn decode_len(input: &mut Cursor<&[u8]>) -> Result<usize, RecordError> {
    let len = input.read_u32::<LittleEndian>()?;
    if len as u64 > remaining(input) {
        return Err(RecordError::Truncated);
    }
    Ok(len as usize)
}

impl RecordCodec for u8 {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u8(*self)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        Ok(input.read_u8()?)
    }
}

impl RecordCodec for u32 {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u32::<LittleEndian>(*self)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        Ok(input.read_u32::<LittleEndian>()?)
    }
}

impl RecordCodec for u64 {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u64::<LittleEndian>(*self)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        Ok(input.read_u64::<LittleEndian>()?)
    }
}

impl RecordCodec for f32 {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_f32::<LittleEndian>(*self)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        Ok(input.read_f32::<LittleEndian>()?)
    }
}

impl RecordCodec for bool {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u8(*self as u8)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        match input.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(RecordError::InvalidValue { what: "bool", value: value as u64 }),
        }
    }
}

impl RecordCodec for String {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        encode_len(self.len(), out)?;
        out.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let len = decode_len(input)?;
        let mut bytes = vec![0; len];
        input.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| RecordError::InvalidUtf8)
    }
}

impl<T: RecordCodec> RecordCodec for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        encode_len(self.len(), out)?;
        for item in self {
            item.encode(out)?;
        }
        Ok(())
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let len = decode_len(input)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

impl<K: RecordCodec + Ord, V: RecordCodec> RecordCodec for BTreeMap<K, V> {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        encode_len(self.len(), out)?;
        for (key, value) in self {
            key.encode(out)?;
            value.encode(out)?;
        }
        Ok(())
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let len = decode_len(input)?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode(input)?;
            map.insert(key, V::decode(input)?);
        }
        Ok(map)
    }
}

macro_rules! record_vk_enum {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RecordCodec for $ty {
                fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
                    out.write_i32::<LittleEndian>(self.as_raw())
                }

                fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
                    Ok(<$ty>::from_raw(input.read_i32::<LittleEndian>()?))
                }
            }
        )*
    };
}

macro_rules! record_vk_flags {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RecordCodec for $ty {
                fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
                    out.write_u32::<LittleEndian>(self.as_raw())
                }

                fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
                    Ok(<$ty>::from_raw(input.read_u32::<LittleEndian>()?))
                }
            }
        )*
    };
}

macro_rules! record_vk_handle {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RecordCodec for $ty {
                fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
                    out.write_u64::<LittleEndian>(self.as_raw())
                }

                fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
                    Ok(<$ty>::from_raw(input.read_u64::<LittleEndian>()?))
                }
            }
        )*
    };
}

/// Encodes the listed fields in order. The struct must have no other fields.
macro_rules! record_struct {
    ($($ty:ty { $($field:ident),* $(,)? })*) => {
        $(
            impl RecordCodec for $ty {
                fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
                    $(self.$field.encode(out)?;)*
                    Ok(())
                }

                fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
                    Ok(Self {
                        $($field: RecordCodec::decode(input)?,)*
                    })
                }
            }
        )*
    };
}

record_vk_enum!(
    vk::Format,
    vk::ImageLayout,
    vk::AttachmentLoadOp,
    vk::AttachmentStoreOp,
    vk::VertexInputRate,
    vk::PrimitiveTopology,
    vk::PolygonMode,
    vk::FrontFace,
    vk::CompareOp,
    vk::StencilOp,
    vk::BlendFactor,
    vk::BlendOp,
    vk::LogicOp,
);

record_vk_flags!(
    vk::ShaderStageFlags,
    vk::SampleCountFlags,
    vk::ImageUsageFlags,
    vk::CullModeFlags,
    vk::ColorComponentFlags,
);

record_vk_handle!(vk::Buffer, vk::ImageView, vk::Sampler);

record_struct! {
    vk::Extent2D { width, height }
    Attachment { format, samples, usage, initial_layout }
    LoadStoreInfo { load_op, store_op }
    SubpassInfo {
        input_attachments,
        output_attachments,
        color_resolve_attachments,
        disable_depth_stencil_attachment,
    }
    RenderTarget { extent, views, attachments }
    ShaderResource {
        stages,
        ty,
        mode,
        set,
        binding,
        array_size,
        offset,
        size,
        constant_id,
        name,
    }
    BufferBinding { buffer, offset, range }
    ImageBinding { sampler, image_view, image_layout }
    VertexInputBinding { binding, stride, input_rate }
    VertexInputAttribute { location, binding, format, offset }
    VertexInputState { bindings, attributes }
    InputAssemblyState { topology, primitive_restart_enable }
    RasterizationState {
        depth_clamp_enable,
        rasterizer_discard_enable,
        polygon_mode,
        cull_mode,
        front_face,
        depth_bias_enable,
    }
    ViewportState { viewport_count, scissor_count }
    MultisampleState {
        rasterization_samples,
        sample_shading_enable,
        min_sample_shading,
        sample_mask,
        alpha_to_coverage_enable,
        alpha_to_one_enable,
    }
    StencilOpState { fail_op, pass_op, depth_fail_op, compare_op }
    DepthStencilState {
        depth_test_enable,
        depth_write_enable,
        depth_compare_op,
        depth_bounds_test_enable,
        stencil_test_enable,
        front,
        back,
    }
    ColorBlendAttachmentState {
        blend_enable,
        src_color_blend_factor,
        dst_color_blend_factor,
        color_blend_op,
        src_alpha_blend_factor,
        dst_alpha_blend_factor,
        alpha_blend_op,
        color_write_mask,
    }
    ColorBlendState { logic_op_enable, logic_op, attachments }
}

impl RecordCodec for ShaderResourceType {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u8(*self as u8)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let raw = input.read_u8()?;
        Self::from_raw(raw).ok_or(RecordError::InvalidValue {
            what: "shader resource type",
            value: raw as u64,
        })
    }
}

impl RecordCodec for ShaderResourceMode {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u8(*self as u8)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let raw = input.read_u8()?;
        Self::from_raw(raw).ok_or(RecordError::InvalidValue {
            what: "shader resource mode",
            value: raw as u64,
        })
    }
}

impl RecordCodec for ShaderSource {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        self.filename().to_owned().encode(out)?;
        self.source().to_owned().encode(out)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let filename = String::decode(input)?;
        let source = String::decode(input)?;
        Ok(Self::from_parts(filename, source))
    }
}

impl RecordCodec for ShaderVariant {
    fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        self.preamble().to_owned().encode(out)?;
        self.processes().to_vec().encode(out)
    }

    fn decode(input: &mut Cursor<&[u8]>) -> Result<Self, RecordError> {
        let preamble = String::decode(input)?;
        let processes = Vec::<String>::decode(input)?;
        Ok(Self::from_parts(preamble, processes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all<T: RecordCodec>(bytes: &[u8]) -> Result<T, RecordError> {
        T::decode(&mut Cursor::new(bytes))
    }

    #[test]
    fn scalars_are_little_endian() {
        let mut out = Vec::new();
        0x0102_0304u32.encode(&mut out).unwrap();
        vk::Format::R8G8B8A8_UNORM.encode(&mut out).unwrap();
        assert_eq!(&out[..4], &[4, 3, 2, 1]);
        assert_eq!(&out[4..], &vk::Format::R8G8B8A8_UNORM.as_raw().to_le_bytes());
    }

    #[test]
    fn shader_resource_survives_encoding() {
        let resource = ShaderResource::new("albedo", ShaderResourceType::ImageSampler, vk::ShaderStageFlags::FRAGMENT)
            .with_binding(1, 3)
            .with_mode(ShaderResourceMode::UpdateAfterBind)
            .with_array_size(4);

        let mut out = Vec::new();
        resource.encode(&mut out).unwrap();
        assert_eq!(decode_all::<ShaderResource>(&out).unwrap(), resource);
    }

    #[test]
    fn cut_input_reports_truncation() {
        let mut out = Vec::new();
        String::from("vertex.glsl").encode(&mut out).unwrap();

        for len in 0..out.len() {
            assert!(matches!(decode_all::<String>(&out[..len]), Err(RecordError::Truncated)));
        }
    }

    #[test]
    fn oversized_length_is_truncation() {
        let mut out = Vec::new();
        u32::MAX.encode(&mut out).unwrap();
        assert!(matches!(decode_all::<Vec<u32>>(&out), Err(RecordError::Truncated)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            decode_all::<bool>(&[2]),
            Err(RecordError::InvalidValue { what: "bool", value: 2 })
        ));
        assert!(matches!(
            decode_all::<ShaderResourceType>(&[200]),
            Err(RecordError::InvalidValue { .. })
        ));
        assert!(matches!(
            decode_all::<String>(&[2, 0, 0, 0, 0xff, 0xfe]),
            Err(RecordError::InvalidUtf8)
        ));
    }

    #[test]
    fn shader_source_keeps_filename() {
        let source = ShaderSource::from_parts("lit.frag".into(), "void main() {}".into());
        let mut out = Vec::new();
        source.encode(&mut out).unwrap();

        let decoded = decode_all::<ShaderSource>(&out).unwrap();
        assert_eq!(decoded.filename(), "lit.frag");
        assert_eq!(decoded.source(), "void main() {}");
    }
}
