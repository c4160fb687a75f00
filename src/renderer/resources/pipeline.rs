use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_set_layout::DescriptorSetLayout;
use crate::renderer::contexts::resource_ctx::resource_type::ShaderResourceType;
use crate::renderer::resources::ResourceId;
use crate::renderer::resources::render_pass::RenderPass;
use crate::renderer::resources::shader::{ShaderModule, ShaderResource};

pub struct PipelineLayout {
    id: ResourceId,
    key: u64,
    handle: vk::PipelineLayout,
    shader_modules: Vec<Arc<ShaderModule>>,
    shader_resources: BTreeMap<String, ShaderResource>,
    shader_sets: BTreeMap<u32, Vec<ShaderResource>>,
    descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
    device: Arc<dyn RenderDevice>,
}

impl PipelineLayout {
    /// Merges the resources of every stage. Resources with the same name are
    /// one resource visible from several stages, except stage inputs and
    /// outputs which are per stage.
    pub(crate) fn collect_resources(
        shader_modules: &[Arc<ShaderModule>],
    ) -> BTreeMap<String, ShaderResource> {
        let mut resources: BTreeMap<String, ShaderResource> = BTreeMap::new();

        for module in shader_modules {
            for resource in module.resources() {
                let key = match resource.ty {
                    ShaderResourceType::Input | ShaderResourceType::Output => {
                        format!("{}_{}", resource.stages.as_raw(), resource.name)
                    }
                    _ => resource.name.clone(),
                };

                resources
                    .entry(key)
                    .and_modify(|merged| merged.stages |= resource.stages)
                    .or_insert_with(|| resource.clone());
            }
        }

        resources
    }

    pub(crate) fn group_by_set(
        resources: &BTreeMap<String, ShaderResource>,
    ) -> BTreeMap<u32, Vec<ShaderResource>> {
        let mut sets: BTreeMap<u32, Vec<ShaderResource>> = BTreeMap::new();
        for resource in resources.values() {
            sets.entry(resource.set).or_default().push(resource.clone());
        }
        sets
    }

    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        shader_modules: &[Arc<ShaderModule>],
        descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    ) -> Result<Self> {
        let shader_resources = Self::collect_resources(shader_modules);
        let shader_sets = Self::group_by_set(&shader_resources);

        let push_constant_ranges = shader_resources
            .values()
            .filter(|resource| resource.ty == ShaderResourceType::PushConstant)
            .map(|resource| vk::PushConstantRange {
                stage_flags: resource.stages,
                offset: resource.offset,
                size: resource.size,
            })
            .collect::<Vec<_>>();

        let set_layout_handles = descriptor_set_layouts
            .iter()
            .map(|layout| layout.handle())
            .collect::<Vec<_>>();

        let handle = device.create_pipeline_layout(&set_layout_handles, &push_constant_ranges)?;

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            shader_modules: shader_modules.to_vec(),
            shader_resources,
            shader_sets,
            descriptor_set_layouts,
            push_constant_ranges,
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn shader_modules(&self) -> &[Arc<ShaderModule>] {
        &self.shader_modules
    }

    pub fn shader_sets(&self) -> &BTreeMap<u32, Vec<ShaderResource>> {
        &self.shader_sets
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }

    /// `ShaderResourceType::All` and `vk::ShaderStageFlags::ALL` act as wildcards.
    pub fn resources(
        &self,
        ty: ShaderResourceType,
        stage: vk::ShaderStageFlags,
    ) -> Vec<&ShaderResource> {
        self.shader_resources
            .values()
            .filter(|resource| ty == ShaderResourceType::All || resource.ty == ty)
            .filter(|resource| stage == vk::ShaderStageFlags::ALL || resource.stages.intersects(stage))
            .collect()
    }

    pub fn has_descriptor_set_layout(&self, set_index: u32) -> bool {
        self.descriptor_set_layouts
            .iter()
            .any(|layout| layout.set_index() == set_index)
    }

    pub fn descriptor_set_layout(&self, set_index: u32) -> Result<&Arc<DescriptorSetLayout>> {
        self.descriptor_set_layouts
            .iter()
            .find(|layout| layout.set_index() == set_index)
            .ok_or_eyre(format!("Couldn't find descriptor set layout at set index {}", set_index))
    }

    pub fn descriptor_set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.descriptor_set_layouts
    }

    /// Stages of every push constant block overlapping `[offset, offset + size)`.
    pub fn push_constant_range_stage(&self, size: u32, offset: u32) -> vk::ShaderStageFlags {
        self.push_constant_ranges
            .iter()
            .filter(|range| offset >= range.offset && offset + size <= range.offset + range.size)
            .fold(vk::ShaderStageFlags::empty(), |stages, range| stages | range.stage_flags)
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.handle);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputState {
    pub bindings: Vec<VertexInputBinding>,
    pub attributes: Vec<VertexInputAttribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterizationState {
    pub depth_clamp_enable: bool,
    // Discards all primitives before rasterization stage if true
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_bias_enable: bool,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_bias_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ViewportState {
    pub viewport_count: u32,
    pub scissor_count: u32,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            viewport_count: 1,
            scissor_count: 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MultisampleState {
    pub rasterization_samples: vk::SampleCountFlags,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    /// Zero means no mask.
    pub sample_mask: u32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            // 1 sample per pixel means no multisampling
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            sample_shading_enable: false,
            min_sample_shading: 1.0,
            sample_mask: 0,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
        }
    }
}

impl PartialEq for MultisampleState {
    fn eq(&self, other: &Self) -> bool {
        self.rasterization_samples == other.rasterization_samples
            && self.sample_shading_enable == other.sample_shading_enable
            && self.min_sample_shading.to_bits() == other.min_sample_shading.to_bits()
            && self.sample_mask == other.sample_mask
            && self.alpha_to_coverage_enable == other.alpha_to_coverage_enable
            && self.alpha_to_one_enable == other.alpha_to_one_enable
    }
}

impl Eq for MultisampleState {}

impl Hash for MultisampleState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rasterization_samples.hash(state);
        self.sample_shading_enable.hash(state);
        self.min_sample_shading.to_bits().hash(state);
        self.sample_mask.hash(state);
        self.alpha_to_coverage_enable.hash(state);
        self.alpha_to_one_enable.hash(state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::REPLACE,
            pass_op: vk::StencilOp::REPLACE,
            depth_fail_op: vk::StencilOp::REPLACE,
            compare_op: vk::CompareOp::NEVER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            front: StencilOpState::default(),
            back: StencilOpState::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachmentState {
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for ColorBlendAttachmentState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendState {
    pub logic_op_enable: bool,
    pub logic_op: vk::LogicOp,
    /// Padded with default attachments up to the subpass color output count.
    pub attachments: Vec<ColorBlendAttachmentState>,
}

impl Default for ColorBlendState {
    fn default() -> Self {
        Self {
            logic_op_enable: false,
            logic_op: vk::LogicOp::COPY,
            attachments: Vec::new(),
        }
    }
}

/// Everything that identifies a graphics or compute pipeline.
#[derive(Clone, Default)]
pub struct PipelineState {
    pipeline_layout: Option<Arc<PipelineLayout>>,
    render_pass: Option<Arc<RenderPass>>,
    subpass_index: u32,
    specialization_constants: BTreeMap<u32, Vec<u8>>,
    vertex_input: VertexInputState,
    input_assembly: InputAssemblyState,
    rasterization: RasterizationState,
    viewport: ViewportState,
    multisample: MultisampleState,
    depth_stencil: DepthStencilState,
    color_blend: ColorBlendState,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline_layout(mut self, layout: Arc<PipelineLayout>) -> Self {
        let _ = self.pipeline_layout.replace(layout);
        self
    }

    pub fn with_render_pass(mut self, render_pass: Arc<RenderPass>) -> Self {
        let _ = self.render_pass.replace(render_pass);
        self
    }

    pub fn with_subpass_index(mut self, subpass_index: u32) -> Self {
        self.subpass_index = subpass_index;
        self
    }

    pub fn with_specialization_constant<T: bytemuck::Pod>(mut self, constant_id: u32, value: &T) -> Self {
        self.specialization_constants
            .insert(constant_id, bytemuck::bytes_of(value).to_vec());
        self
    }

    pub(crate) fn with_specialization_constants(mut self, constants: BTreeMap<u32, Vec<u8>>) -> Self {
        self.specialization_constants = constants;
        self
    }

    pub fn with_vertex_input(mut self, vertex_input: VertexInputState) -> Self {
        self.vertex_input = vertex_input;
        self
    }

    pub fn with_input_assembly(mut self, input_assembly: InputAssemblyState) -> Self {
        self.input_assembly = input_assembly;
        self
    }

    pub fn with_rasterization(mut self, rasterization: RasterizationState) -> Self {
        self.rasterization = rasterization;
        self
    }

    pub fn with_viewport(mut self, viewport: ViewportState) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn with_multisample(mut self, multisample: MultisampleState) -> Self {
        self.multisample = multisample;
        self
    }

    pub fn with_depth_stencil(mut self, depth_stencil: DepthStencilState) -> Self {
        self.depth_stencil = depth_stencil;
        self
    }

    pub fn with_color_blend(mut self, color_blend: ColorBlendState) -> Self {
        self.color_blend = color_blend;
        self
    }

    pub fn with_input_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.input_assembly.topology = topology;
        self.input_assembly.primitive_restart_enable = false;
        self
    }

    pub fn with_polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.rasterization.polygon_mode = mode;
        self
    }

    pub fn with_cull_mode(
        mut self,
        cull_mode: vk::CullModeFlags,
        front_face: vk::FrontFace,
    ) -> Self {
        self.rasterization.cull_mode = cull_mode;
        self.rasterization.front_face = front_face;
        self
    }

    pub fn with_multisampling_disabled(mut self) -> Self {
        self.multisample = MultisampleState::default();
        self
    }

    pub fn with_blending_disabled(mut self) -> Self {
        for blend in self.color_blend_attachments_mut() {
            blend.color_write_mask = vk::ColorComponentFlags::RGBA;
            blend.blend_enable = false;
        }
        self
    }

    // Make sure the transparent object is rendered AFTER the opaque ones
    pub fn with_alpha_blending_enabled(mut self) -> Self {
        for blend in self.color_blend_attachments_mut() {
            blend.color_write_mask = vk::ColorComponentFlags::RGBA;
            blend.blend_enable = true;
            blend.src_color_blend_factor = vk::BlendFactor::SRC_ALPHA;
            blend.dst_color_blend_factor = vk::BlendFactor::ONE_MINUS_SRC_ALPHA;
            blend.color_blend_op = vk::BlendOp::ADD;
            blend.src_alpha_blend_factor = vk::BlendFactor::ONE;
            blend.dst_alpha_blend_factor = vk::BlendFactor::ZERO;
            blend.alpha_blend_op = vk::BlendOp::ADD;
        }
        self
    }

    pub fn with_additive_blending_enabled(mut self) -> Self {
        for blend in self.color_blend_attachments_mut() {
            blend.color_write_mask = vk::ColorComponentFlags::RGBA;
            blend.blend_enable = true;
            blend.src_color_blend_factor = vk::BlendFactor::ONE;
            blend.dst_color_blend_factor = vk::BlendFactor::DST_ALPHA;
            blend.color_blend_op = vk::BlendOp::ADD;
            blend.src_alpha_blend_factor = vk::BlendFactor::ONE;
            blend.dst_alpha_blend_factor = vk::BlendFactor::ZERO;
            blend.alpha_blend_op = vk::BlendOp::ADD;
        }
        self
    }

    pub fn with_depth_test(
        mut self,
        enable: bool,
        compare: Option<vk::CompareOp>,
    ) -> Self {
        self.depth_stencil.depth_test_enable = enable;
        self.depth_stencil.depth_write_enable = enable;
        self.depth_stencil.depth_compare_op = if enable {
            compare.unwrap_or(vk::CompareOp::LESS_OR_EQUAL)
        } else {
            vk::CompareOp::ALWAYS
        };
        self
    }

    // Blend presets apply to every attachment, creating the first one if needed
    fn color_blend_attachments_mut(&mut self) -> &mut [ColorBlendAttachmentState] {
        if self.color_blend.attachments.is_empty() {
            self.color_blend.attachments.push(ColorBlendAttachmentState::default());
        }
        &mut self.color_blend.attachments
    }

    pub fn pipeline_layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.pipeline_layout.as_ref()
    }

    pub fn render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.render_pass.as_ref()
    }

    pub fn subpass_index(&self) -> u32 {
        self.subpass_index
    }

    pub fn specialization_constants(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.specialization_constants
    }

    pub fn vertex_input(&self) -> &VertexInputState {
        &self.vertex_input
    }

    pub fn input_assembly(&self) -> &InputAssemblyState {
        &self.input_assembly
    }

    pub fn rasterization(&self) -> &RasterizationState {
        &self.rasterization
    }

    pub fn viewport(&self) -> &ViewportState {
        &self.viewport
    }

    pub fn multisample(&self) -> &MultisampleState {
        &self.multisample
    }

    pub fn depth_stencil(&self) -> &DepthStencilState {
        &self.depth_stencil
    }

    pub fn color_blend(&self) -> &ColorBlendState {
        &self.color_blend
    }
}

/// Referenced objects take part through their structural keys.
impl Hash for PipelineState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pipeline_layout.as_ref().map(|layout| layout.key()).hash(state);
        self.render_pass.as_ref().map(|render_pass| render_pass.key()).hash(state);
        self.subpass_index.hash(state);
        self.specialization_constants.hash(state);
        self.vertex_input.hash(state);
        self.input_assembly.hash(state);
        self.rasterization.hash(state);
        self.viewport.hash(state);
        self.multisample.hash(state);
        self.depth_stencil.hash(state);
        self.color_blend.hash(state);
    }
}

pub struct GraphicsPipeline {
    id: ResourceId,
    key: u64,
    handle: vk::Pipeline,
    state: PipelineState,
    device: Arc<dyn RenderDevice>,
}

impl GraphicsPipeline {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        pipeline_cache: vk::PipelineCache,
        state: &PipelineState,
    ) -> Result<Self> {
        let render_pass = state
            .render_pass()
            .ok_or_eyre("No render pass provided for graphics pipeline")?;
        if state.subpass_index() as usize >= render_pass.subpass_count() {
            return Err(eyre!(
                "Subpass index {} is out of range for a render pass with {} subpasses",
                state.subpass_index(),
                render_pass.subpass_count(),
            ));
        }
        let layout = state
            .pipeline_layout()
            .ok_or_eyre("No pipeline layout provided for graphics pipeline")?;
        if layout.shader_modules().iter().any(|module| module.stage() == vk::ShaderStageFlags::COMPUTE) {
            return Err(eyre!("Graphics pipeline layout contains a compute shader"));
        }

        let handle = device.create_graphics_pipeline(pipeline_cache, state)?;

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            state: state.clone(),
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}

pub struct ComputePipeline {
    id: ResourceId,
    key: u64,
    handle: vk::Pipeline,
    state: PipelineState,
    device: Arc<dyn RenderDevice>,
}

impl ComputePipeline {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        key: u64,
        pipeline_cache: vk::PipelineCache,
        state: &PipelineState,
    ) -> Result<Self> {
        let layout = state
            .pipeline_layout()
            .ok_or_eyre("No pipeline layout provided for compute pipeline")?;
        match layout.shader_modules() {
            [module] if module.stage() == vk::ShaderStageFlags::COMPUTE => {}
            _ => return Err(eyre!("Compute pipeline layout must contain exactly one compute shader")),
        }

        let handle = device.create_compute_pipeline(pipeline_cache, state)?;

        Ok(Self {
            id: ResourceId::next(),
            key,
            handle,
            state: state.clone(),
            device,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}
