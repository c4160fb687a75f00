use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use gpu_descriptor::{CreatePoolError, DescriptorTotalCount, DeviceAllocationError};
use smallvec::SmallVec;
use crate::renderer::contexts::device_ctx::{RenderDevice, ShaderCompiler};
use crate::renderer::contexts::resource_ctx::descriptor_set::{DescriptorInfo, DescriptorWrite};
use crate::renderer::resources::pipeline::{ColorBlendAttachmentState, PipelineState, StencilOpState};
use crate::renderer::resources::render_pass::{Attachment, LoadStoreInfo, SubpassInfo};
use crate::renderer::resources::shader::{ShaderResource, ShaderSource, ShaderVariant};

/// `RenderDevice` over an existing ash logical device. Instance, device and
/// queue creation stay with the application.
pub struct AshRenderDevice {
    pub logical: Arc<ash::Device>,
    pub physical: vk::PhysicalDevice,
    limits: vk::PhysicalDeviceLimits,

    memory_allocator: Arc<Mutex<Allocator>>,
    buffer_allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
    shader_compiler: Arc<dyn ShaderCompiler>,
}

impl AshRenderDevice {
    pub fn new(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        logical: Arc<ash::Device>,
        shader_compiler: Arc<dyn ShaderCompiler>,
    ) -> Result<Self> {
        let limits = unsafe {
            instance.get_physical_device_properties(physical).limits
        };

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*logical).clone(),
            physical_device: physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: false,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            logical,
            physical,
            limits,
            memory_allocator: Arc::new(Mutex::new(memory_allocator)),
            buffer_allocations: Mutex::new(HashMap::new()),
            shader_compiler,
        })
    }
}

fn descriptor_pool_sizes(
    descriptor_count: &DescriptorTotalCount,
) -> SmallVec<[vk::DescriptorPoolSize; 13]> {
    let counts = [
        (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
        (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
        (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
        (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
        (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
        (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
        (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
        (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
        (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
        (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
        (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, descriptor_count.acceleration_structure),
    ];

    if descriptor_count.inline_uniform_block_bytes != 0
        || descriptor_count.inline_uniform_block_bindings != 0
    {
        log::warn!("Inline uniform blocks are not supported, ignoring their pool sizes");
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count != 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect()
}

fn specialization_data(
    constants: &BTreeMap<u32, Vec<u8>>,
) -> (Vec<vk::SpecializationMapEntry>, Vec<u8>) {
    let mut entries = Vec::with_capacity(constants.len());
    let mut data = Vec::new();
    for (&constant_id, value) in constants {
        entries.push(vk::SpecializationMapEntry {
            constant_id,
            offset: data.len() as u32,
            size: value.len(),
        });
        data.extend_from_slice(value);
    }
    (entries, data)
}

fn stencil_op_state(state: &StencilOpState) -> vk::StencilOpState {
    vk::StencilOpState::default()
        .fail_op(state.fail_op)
        .pass_op(state.pass_op)
        .depth_fail_op(state.depth_fail_op)
        .compare_op(state.compare_op)
        .compare_mask(!0)
        .write_mask(!0)
        .reference(0)
}

struct SubpassReferences {
    inputs: Vec<vk::AttachmentReference>,
    colors: Vec<vk::AttachmentReference>,
    resolves: Vec<vk::AttachmentReference>,
    depth_stencil: Option<vk::AttachmentReference>,
}

fn subpass_references(
    attachments: &[Attachment],
    subpass: &SubpassInfo,
) -> Result<SubpassReferences> {
    let attachment = |index: u32| {
        attachments
            .get(index as usize)
            .ok_or_eyre(format!("Subpass references missing attachment {}", index))
    };

    let mut inputs = Vec::with_capacity(subpass.input_attachments.len());
    for &index in &subpass.input_attachments {
        let layout = if attachment(index)?.is_depth_stencil() {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
        inputs.push(vk::AttachmentReference { attachment: index, layout });
    }

    let mut colors = Vec::with_capacity(subpass.output_attachments.len());
    for &index in &subpass.output_attachments {
        if !attachment(index)?.is_depth_stencil() {
            colors.push(vk::AttachmentReference {
                attachment: index,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
        }
    }

    let mut resolves = Vec::with_capacity(subpass.color_resolve_attachments.len());
    for &index in &subpass.color_resolve_attachments {
        attachment(index)?;
        resolves.push(vk::AttachmentReference {
            attachment: index,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
    }
    if !resolves.is_empty() && resolves.len() != colors.len() {
        return Err(eyre!(
            "Subpass has {} resolve attachments for {} color attachments",
            resolves.len(),
            colors.len(),
        ));
    }

    let depth_stencil = if subpass.disable_depth_stencil_attachment {
        None
    } else {
        attachments
            .iter()
            .position(Attachment::is_depth_stencil)
            .map(|index| vk::AttachmentReference {
                attachment: index as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            })
    };

    Ok(SubpassReferences {
        inputs,
        colors,
        resolves,
        depth_stencil,
    })
}

impl RenderDevice for AshRenderDevice {
    fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.limits
    }

    fn create_shader_module(
        &self,
        stage: vk::ShaderStageFlags,
        source: &ShaderSource,
        entry_point: &str,
        variant: &ShaderVariant,
    ) -> Result<(vk::ShaderModule, Vec<ShaderResource>)> {
        let compiled = self.shader_compiler.compile(stage, source, entry_point, variant)?;

        let shader_module_info = vk::ShaderModuleCreateInfo::default()
            .code(&compiled.code);

        let shader_module = unsafe {
            self.logical.create_shader_module(&shader_module_info, None)?
        };

        Ok((shader_module, compiled.resources))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe {
            self.logical.destroy_shader_module(module, None);
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        binding_flags: &[vk::DescriptorBindingFlags],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(bindings)
            .flags(flags);
        if !binding_flags.is_empty() {
            layout_info = layout_info.push_next(&mut binding_flags_info);
        }

        Ok(unsafe {
            self.logical.create_descriptor_set_layout(&layout_info, None)?
        })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe {
            self.logical.destroy_descriptor_set_layout(layout, None);
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        Ok(unsafe {
            self.logical.create_pipeline_layout(&layout_info, None)?
        })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe {
            self.logical.destroy_pipeline_layout(layout, None);
        }
    }

    fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> std::result::Result<vk::DescriptorPool, CreatePoolError> {
        let pool_sizes = descriptor_pool_sizes(descriptor_count);

        let result = unsafe {
            self.logical.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("Unexpected return code '{}' creating descriptor pool", err);
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        unsafe {
            self.logical.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.logical.destroy_descriptor_pool(pool, None);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, DeviceAllocationError> {
        let set_layouts = [layout];
        let result = unsafe {
            self.logical.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(pool),
            )
        };

        match result {
            Ok(allocated) => allocated
                .first()
                .copied()
                .ok_or(DeviceAllocationError::OutOfPoolMemory),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceAllocationError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
            Err(err) => {
                log::error!("Unexpected return code '{}' allocating descriptor set", err);
                Err(DeviceAllocationError::OutOfHostMemory)
            }
        }
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        unsafe {
            self.logical.free_descriptor_sets(pool, &[set])?;
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        if writes.is_empty() {
            return;
        }

        // Info structs must outlive the write structs pointing into them
        let buffer_infos: SmallVec<[vk::DescriptorBufferInfo; 16]> = writes
            .iter()
            .map(|write| match write.info {
                DescriptorInfo::Buffer(binding) => binding.to_vk(),
                DescriptorInfo::Image(_) => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: SmallVec<[vk::DescriptorImageInfo; 16]> = writes
            .iter()
            .map(|write| match write.info {
                DescriptorInfo::Image(binding) => binding.to_vk(),
                DescriptorInfo::Buffer(_) => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let vk_writes = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let vk_write = vk::WriteDescriptorSet::default()
                    .dst_set(write.dst_set)
                    .dst_binding(write.dst_binding)
                    .dst_array_element(write.dst_array_element)
                    .descriptor_type(write.descriptor_type);
                match write.info {
                    DescriptorInfo::Buffer(_) => vk_write.buffer_info(std::slice::from_ref(&buffer_infos[i])),
                    DescriptorInfo::Image(_) => vk_write.image_info(std::slice::from_ref(&image_infos[i])),
                }
            })
            .collect::<Vec<_>>();

        unsafe {
            self.logical.update_descriptor_sets(&vk_writes, &[]);
        }
    }

    fn create_render_pass(
        &self,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> Result<vk::RenderPass> {
        let attachment_descriptions = attachments
            .iter()
            .enumerate()
            .map(|(i, attachment)| {
                let load_store = load_store_infos.get(i).copied().unwrap_or_default();
                let (stencil_load_op, stencil_store_op, final_layout) = if attachment.is_depth_stencil() {
                    (load_store.load_op, load_store.store_op, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                } else {
                    (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                };
                vk::AttachmentDescription::default()
                    .format(attachment.format)
                    .samples(attachment.samples)
                    .load_op(load_store.load_op)
                    .store_op(load_store.store_op)
                    .stencil_load_op(stencil_load_op)
                    .stencil_store_op(stencil_store_op)
                    .initial_layout(attachment.initial_layout)
                    .final_layout(final_layout)
            })
            .collect::<Vec<_>>();

        // Without subpass infos, one subpass writes every attachment
        let default_subpass;
        let subpasses = if subpasses.is_empty() {
            default_subpass = [SubpassInfo {
                output_attachments: (0..attachments.len() as u32).collect(),
                ..Default::default()
            }];
            &default_subpass[..]
        } else {
            subpasses
        };

        let references = subpasses
            .iter()
            .map(|subpass| subpass_references(attachments, subpass))
            .collect::<Result<Vec<_>>>()?;

        let subpass_descriptions = references
            .iter()
            .map(|references| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&references.inputs)
                    .color_attachments(&references.colors);
                if !references.resolves.is_empty() {
                    description = description.resolve_attachments(&references.resolves);
                }
                if let Some(depth_stencil) = references.depth_stencil.as_ref() {
                    description = description.depth_stencil_attachment(depth_stencil);
                }
                description
            })
            .collect::<Vec<_>>();

        let dependencies = (1..subpass_descriptions.len() as u32)
            .map(|subpass| {
                vk::SubpassDependency::default()
                    .src_subpass(subpass - 1)
                    .dst_subpass(subpass)
                    .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                    .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                    .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                    .dst_access_mask(vk::AccessFlags::INPUT_ATTACHMENT_READ)
                    .dependency_flags(vk::DependencyFlags::BY_REGION)
            })
            .collect::<Vec<_>>();

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachment_descriptions)
            .subpasses(&subpass_descriptions)
            .dependencies(&dependencies);

        Ok(unsafe {
            self.logical.create_render_pass(&render_pass_info, None)?
        })
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe {
            self.logical.destroy_render_pass(render_pass, None);
        }
    }

    fn create_graphics_pipeline(
        &self,
        pipeline_cache: vk::PipelineCache,
        state: &PipelineState,
    ) -> Result<vk::Pipeline> {
        let layout = state
            .pipeline_layout()
            .ok_or_eyre("No pipeline layout provided for graphics pipeline")?;
        let render_pass = state
            .render_pass()
            .ok_or_eyre("No render pass provided for graphics pipeline")?;

        let (map_entries, specialization_bytes) = specialization_data(state.specialization_constants());
        let specialization_info = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(&specialization_bytes);

        let entry_points = layout
            .shader_modules()
            .iter()
            .map(|module| CString::new(module.entry_point()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let shader_stages = layout
            .shader_modules()
            .iter()
            .zip(entry_points.iter())
            .map(|(module, entry_point)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(module.stage())
                    .module(module.handle())
                    .name(entry_point)
                    .specialization_info(&specialization_info)
            })
            .collect::<Vec<_>>();

        let vertex_bindings = state
            .vertex_input()
            .bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.input_rate,
            })
            .collect::<Vec<_>>();
        let vertex_attributes = state
            .vertex_input()
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect::<Vec<_>>();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.input_assembly().topology)
            .primitive_restart_enable(state.input_assembly().primitive_restart_enable);

        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(state.viewport().viewport_count)
            .scissor_count(state.viewport().scissor_count);

        let raster = state.rasterization();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(raster.depth_clamp_enable)
            .rasterizer_discard_enable(raster.rasterizer_discard_enable)
            .polygon_mode(raster.polygon_mode)
            .cull_mode(raster.cull_mode)
            .front_face(raster.front_face)
            .depth_bias_enable(raster.depth_bias_enable)
            .line_width(1.0);

        let sample_mask = [state.multisample().sample_mask];
        let mut multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(state.multisample().rasterization_samples)
            .sample_shading_enable(state.multisample().sample_shading_enable)
            .min_sample_shading(state.multisample().min_sample_shading)
            .alpha_to_coverage_enable(state.multisample().alpha_to_coverage_enable)
            .alpha_to_one_enable(state.multisample().alpha_to_one_enable);
        if state.multisample().sample_mask != 0 {
            multisample = multisample.sample_mask(&sample_mask);
        }

        let depth = state.depth_stencil();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth.depth_test_enable)
            .depth_write_enable(depth.depth_write_enable)
            .depth_compare_op(depth.depth_compare_op)
            .depth_bounds_test_enable(depth.depth_bounds_test_enable)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(depth.stencil_test_enable)
            .front(stencil_op_state(&depth.front))
            .back(stencil_op_state(&depth.back));

        // The attachment count must match the subpass color outputs
        let color_output_count = render_pass.color_output_count(state.subpass_index()) as usize;
        let mut blend_states = state.color_blend().attachments.clone();
        blend_states.resize(color_output_count, ColorBlendAttachmentState::default());
        let color_blend_attachments = blend_states
            .iter()
            .map(|blend| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(blend.blend_enable)
                    .src_color_blend_factor(blend.src_color_blend_factor)
                    .dst_color_blend_factor(blend.dst_color_blend_factor)
                    .color_blend_op(blend.color_blend_op)
                    .src_alpha_blend_factor(blend.src_alpha_blend_factor)
                    .dst_alpha_blend_factor(blend.dst_alpha_blend_factor)
                    .alpha_blend_op(blend.alpha_blend_op)
                    .color_write_mask(blend.color_write_mask)
            })
            .collect::<Vec<_>>();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(state.color_blend().logic_op_enable)
            .logic_op(state.color_blend().logic_op)
            .attachments(&color_blend_attachments)
            .blend_constants([1.0, 1.0, 1.0, 1.0]);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
            vk::DynamicState::DEPTH_BIAS,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::DEPTH_BOUNDS,
            vk::DynamicState::STENCIL_COMPARE_MASK,
            vk::DynamicState::STENCIL_WRITE_MASK,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_info = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_info)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(state.subpass_index());

        let pipelines = unsafe {
            self.logical.create_graphics_pipelines(pipeline_cache, &[pipeline_info], None)
        }.map_err(|(_, err)| eyre!("Failed to create graphics pipeline: {}", err))?;

        pipelines
            .first()
            .copied()
            .ok_or_eyre("Graphics pipeline creation returned no pipeline")
    }

    fn create_compute_pipeline(
        &self,
        pipeline_cache: vk::PipelineCache,
        state: &PipelineState,
    ) -> Result<vk::Pipeline> {
        let layout = state
            .pipeline_layout()
            .ok_or_eyre("No pipeline layout provided for compute pipeline")?;
        let module = layout
            .shader_modules()
            .first()
            .ok_or_eyre("No shader provided for compute pipeline")?;

        let (map_entries, specialization_bytes) = specialization_data(state.specialization_constants());
        let specialization_info = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(&specialization_bytes);

        let name = CString::new(module.entry_point())?;
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module.handle())
            .name(&name)
            .specialization_info(&specialization_info);

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .layout(layout.handle())
            .stage(stage_info);

        let pipelines = unsafe {
            self.logical.create_compute_pipelines(pipeline_cache, &[pipeline_info], None)
        }.map_err(|(_, err)| eyre!("Failed to create compute pipeline: {}", err))?;

        pipelines
            .first()
            .copied()
            .ok_or_eyre("Compute pipeline creation returned no pipeline")
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.logical.destroy_pipeline(pipeline, None);
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        Ok(unsafe {
            self.logical.create_framebuffer(&framebuffer_info, None)?
        })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe {
            self.logical.destroy_framebuffer(framebuffer, None);
        }
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let buffer = {
            let buffer_info = vk::BufferCreateInfo {
                size,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            unsafe { self.logical.create_buffer(&buffer_info, None)? }
        };

        let requirements = unsafe { self.logical.get_buffer_memory_requirements(buffer) };
        let allocation = self.memory_allocator
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .allocate(&AllocationCreateDesc {
                name: "buffer pool block",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.logical.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        unsafe {
            self.logical.bind_buffer_memory(
                buffer,
                allocation.memory(),
                allocation.offset(),
            )?;
        }

        self.buffer_allocations
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .insert(buffer, allocation);

        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut allocations = self.buffer_allocations
            .lock()
            .map_err(|e| eyre!(e.to_string()))?;
        let allocation = allocations
            .get_mut(&buffer)
            .ok_or_eyre("Writing to a buffer that was not created by this device")?;

        presser::copy_from_slice_to_offset(data, allocation, offset as usize)?;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = match self.buffer_allocations.lock() {
            Ok(mut allocations) => allocations.remove(&buffer),
            Err(err) => {
                log::error!("Buffer allocation map poisoned: {}", err);
                None
            }
        };

        if let Some(allocation) = allocation {
            match self.memory_allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(err) = allocator.free(allocation) {
                        log::error!("Failed to free buffer memory: {}", err);
                    }
                }
                Err(err) => log::error!("Memory allocator poisoned: {}", err),
            }
        }

        unsafe {
            self.logical.destroy_buffer(buffer, None);
        }
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);

        Ok(unsafe {
            self.logical.create_command_pool(&pool_info, None)?
        })
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.logical.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.logical.destroy_command_pool(pool, None);
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .command_buffer_count(1)
            .level(level);

        let command_buffers = unsafe {
            self.logical.allocate_command_buffers(&command_buffer_info)?
        };

        command_buffers
            .first()
            .copied()
            .ok_or_eyre("Command buffer allocation returned no command buffer")
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.logical.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.logical.free_command_buffers(pool, command_buffers);
        }
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        Ok(unsafe {
            self.logical.create_fence(&vk::FenceCreateInfo::default(), None)?
        })
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> Result<()> {
        unsafe {
            self.logical.wait_for_fences(fences, true, timeout)?;
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        unsafe {
            self.logical.reset_fences(fences)?;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.logical.destroy_fence(fence, None);
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(unsafe {
            self.logical.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.logical.destroy_semaphore(semaphore, None);
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.logical.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for AshRenderDevice {
    fn drop(&mut self) {
        let leftover = match self.buffer_allocations.get_mut() {
            Ok(allocations) => allocations.drain().collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        if leftover.is_empty() {
            return;
        }

        log::warn!("{} buffers still alive when the device was dropped", leftover.len());
        if let Ok(mut allocator) = self.memory_allocator.lock() {
            for (buffer, allocation) in leftover {
                if let Err(err) = allocator.free(allocation) {
                    log::error!("Failed to free buffer memory: {}", err);
                }
                unsafe {
                    self.logical.destroy_buffer(buffer, None);
                }
            }
        }
    }
}
