//! Graphics pipeline creation for dynamic rendering.
//!
//! Shaders are precompiled SPIR-V loaded from disk; bytecode is an opaque
//! blob here. The descriptor set layout carries the push-descriptor flag so
//! draws bind resources through the pipeline's [`BindingTemplate`] instead of
//! descriptor pools.

use std::fs::File;
use std::path::{Path, PathBuf};

use ash::vk;

use crate::bindings::{BindingKind, BindingTemplate, Descriptor};
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::swapchain::DEPTH_FORMAT;

/// Creation parameters for a graphics pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    /// Ordered binding declarations for set 0.
    pub bindings: Vec<BindingKind>,
    /// Shader stages that read the bindings.
    pub binding_stages: vk::ShaderStageFlags,
    /// Size in bytes of the vertex-stage push constant block; 0 for none.
    pub push_constant_size: u32,
    /// Color attachment format, normally the swapchain format.
    pub color_format: vk::Format,
}

/// Read a SPIR-V file into a shader module.
pub fn load_shader_module(
    device: &ash::Device,
    path: &Path,
) -> Result<vk::ShaderModule, GraphicsError> {
    let mut file = File::open(path).map_err(|e| {
        GraphicsError::ShaderLoadFailed(format!("{}: {}", path.display(), e))
    })?;

    let code = ash::util::read_spv(&mut file).map_err(|e| {
        GraphicsError::ShaderLoadFailed(format!("{}: {}", path.display(), e))
    })?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
    unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
        GraphicsError::ShaderLoadFailed(format!("{}: {:?}", path.display(), e))
    })
}

/// A graphics pipeline, its layouts and its binding template.
pub struct Pipeline {
    device: ash::Device,
    descriptor_set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    template: BindingTemplate,
    push_constant_size: u32,
}

impl Pipeline {
    pub fn create(
        ctx: &DeviceContext,
        settings: &PipelineSettings,
    ) -> Result<Self, GraphicsError> {
        let device = ctx.device();

        let template =
            BindingTemplate::new(settings.bindings.clone(), settings.binding_stages);

        let set_bindings = template.layout_bindings();
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&set_bindings);

        let descriptor_set_layout =
            unsafe { device.create_descriptor_set_layout(&set_layout_info, None) }.map_err(
                |e| {
                    GraphicsError::ResourceCreationFailed(format!(
                        "Failed to create descriptor set layout: {:?}",
                        e
                    ))
                },
            )?;

        let set_layouts = [descriptor_set_layout];
        let push_constant_ranges = if settings.push_constant_size > 0 {
            vec![vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .offset(0)
                .size(settings.push_constant_size)]
        } else {
            vec![]
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(descriptor_set_layout, None) };
                return Err(GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create pipeline layout: {:?}",
                    e
                )));
            }
        };

        let pipeline = match create_graphics_pipeline(device, layout, settings) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_descriptor_set_layout(descriptor_set_layout, None);
                }
                return Err(e);
            }
        };

        log::info!(
            "Created pipeline ({} bindings, push constants {} bytes)",
            template.len(),
            settings.push_constant_size
        );

        Ok(Self {
            device: device.clone(),
            descriptor_set_layout,
            layout,
            pipeline,
            template,
            push_constant_size: settings.push_constant_size,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn template(&self) -> &BindingTemplate {
        &self.template
    }

    /// Bind for graphics.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline)
        };
    }

    /// Push `descriptors` for this pipeline's set 0 in one batched call.
    pub fn push_descriptors(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        descriptors: &[Descriptor],
    ) {
        self.template
            .push(ctx.push_descriptor_loader(), cmd, self.layout, descriptors);
    }

    /// Write the vertex-stage push constant block.
    pub fn push_constants(&self, cmd: vk::CommandBuffer, data: &[u8]) {
        debug_assert!(
            data.len() as u32 <= self.push_constant_size,
            "push constant data exceeds the declared range"
        );
        unsafe {
            self.device
                .cmd_push_constants(cmd, self.layout, vk::ShaderStageFlags::VERTEX, 0, data)
        };
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    settings: &PipelineSettings,
) -> Result<vk::Pipeline, GraphicsError> {
    let vertex_module = load_shader_module(device, &settings.vertex_shader)?;
    let fragment_module = match load_shader_module(device, &settings.fragment_shader) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(c"main"),
    ];

    let color_formats = [settings.color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(DEPTH_FORMAT);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_info =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    // Geometry is pulled from storage buffers, so no vertex input bindings.
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default();

    let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport_info = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_info = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample_info = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)];

    let color_blend_info = vk::PipelineColorBlendStateCreateInfo::default()
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .push_next(&mut rendering_info)
        .stages(&stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly_info)
        .viewport_state(&viewport_info)
        .rasterization_state(&rasterization_info)
        .multisample_state(&multisample_info)
        .depth_stencil_state(&depth_stencil_info)
        .color_blend_state(&color_blend_info)
        .dynamic_state(&dynamic_state_info)
        .layout(layout);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);
    }

    match result {
        Ok(pipelines) => Ok(pipelines[0]),
        Err((_, e)) => Err(GraphicsError::ResourceCreationFailed(format!(
            "Failed to create graphics pipeline: {:?}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_clone() {
        let settings = PipelineSettings {
            vertex_shader: PathBuf::from("shaders/simple.vert.spv"),
            fragment_shader: PathBuf::from("shaders/simple.frag.spv"),
            bindings: vec![BindingKind::Buffer, BindingKind::Buffer],
            binding_stages: vk::ShaderStageFlags::VERTEX,
            push_constant_size: 64,
            color_format: vk::Format::B8G8R8A8_UNORM,
        };
        let copy = settings.clone();
        assert_eq!(copy.bindings.len(), 2);
        assert_eq!(copy.push_constant_size, 64);
    }
}
