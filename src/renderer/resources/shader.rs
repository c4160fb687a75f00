use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::resource_type::{ShaderResourceMode, ShaderResourceType};
use crate::renderer::resources::ResourceId;

pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Shader text. Only the text takes part in equality and hashing,
/// the filename is kept for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct ShaderSource {
    filename: String,
    source: String,
}

impl ShaderSource {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            filename: String::new(),
            source: source.into(),
        }
    }

    pub(crate) fn from_parts(filename: String, source: String) -> Self {
        Self {
            filename,
            source,
        }
    }

    pub fn load(filepath: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(filepath)?;
        Ok(Self {
            filename: filepath.display().to_string(),
            source,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl PartialEq for ShaderSource {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for ShaderSource {}

impl Hash for ShaderSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// A set of preprocessor definitions prepended to a shader source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderVariant {
    preamble: String,
    processes: Vec<String>,
}

impl ShaderVariant {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(preamble: String, processes: Vec<String>) -> Self {
        Self {
            preamble,
            processes,
        }
    }

    /// `NAME=VALUE` becomes `#define NAME VALUE`.
    pub fn add_define(&mut self, definition: &str) {
        self.processes.push(format!("D{}", definition));
        let definition = definition.replacen('=', " ", 1);
        self.preamble.push_str(&format!("#define {}\n", definition));
    }

    pub fn add_definitions(&mut self, definitions: &[&str]) {
        for definition in definitions {
            self.add_define(definition);
        }
    }

    pub fn add_undefine(&mut self, undefinition: &str) {
        self.processes.push(format!("U{}", undefinition));
        self.preamble.push_str(&format!("#undef {}\n", undefinition));
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn processes(&self) -> &[String] {
        &self.processes
    }

    pub fn clear(&mut self) {
        self.preamble.clear();
        self.processes.clear();
    }
}

/// Reflection record for one named resource of a shader.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderResource {
    pub stages: vk::ShaderStageFlags,
    pub ty: ShaderResourceType,
    pub mode: ShaderResourceMode,
    pub set: u32,
    pub binding: u32,
    pub array_size: u32,
    pub offset: u32,
    pub size: u32,
    pub constant_id: u32,
    pub name: String,
}

impl ShaderResource {
    pub fn new(
        name: impl Into<String>,
        ty: ShaderResourceType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            stages,
            ty,
            mode: ShaderResourceMode::Static,
            set: 0,
            binding: 0,
            array_size: 1,
            offset: 0,
            size: 0,
            constant_id: 0,
            name: name.into(),
        }
    }

    pub fn with_binding(mut self, set: u32, binding: u32) -> Self {
        self.set = set;
        self.binding = binding;
        self
    }

    pub fn with_mode(mut self, mode: ShaderResourceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    pub fn with_range(mut self, offset: u32, size: u32) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }
}

pub struct ShaderModule {
    id: ResourceId,
    key: u64,
    handle: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: String,
    source: ShaderSource,
    variant: ShaderVariant,
    resources: Vec<ShaderResource>,
    device: Arc<dyn RenderDevice>,
}

impl ShaderModule {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        entry_point: &str,
        variant: &ShaderVariant,
    ) -> Result<Self> {
        let (handle, mut resources) = device.create_shader_module(stage, source, entry_point, variant)?;

        // Reflection reports resources per module, so they belong to this stage only
        for resource in resources.iter_mut() {
            resource.stages = stage;
        }

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            stage,
            entry_point: entry_point.to_string(),
            source: source.clone(),
            variant: variant.clone(),
            resources,
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn source(&self) -> &ShaderSource {
        &self.source
    }

    pub fn variant(&self) -> &ShaderVariant {
        &self.variant
    }

    pub fn resources(&self) -> &[ShaderResource] {
        &self.resources
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.handle);
    }
}
