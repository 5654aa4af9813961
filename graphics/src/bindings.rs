//! Push-descriptor binding template.
//!
//! A pipeline declares its bindings once, as an ordered list of
//! [`BindingKind`]s. At draw time the caller hands over resources in the same
//! order and the template pushes them in one batched call. Binding slot `i`
//! always receives entry `i` of the caller's list.

use ash::vk;

use crate::resources::{GpuBuffer, GpuImage};

/// What a binding slot holds. Declared once per pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// A shader storage buffer.
    Buffer,
    /// A combined image sampler.
    Image,
}

impl BindingKind {
    pub(crate) fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::Buffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::Image => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// A resource supplied at draw time, tagged by what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl Descriptor {
    /// Bind a buffer in full.
    pub fn whole_buffer(buffer: &GpuBuffer) -> Self {
        Self::Buffer {
            buffer: buffer.handle(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Bind a sampled image in `SHADER_READ_ONLY_OPTIMAL` layout.
    ///
    /// The image must have a sampler attached; binding a sampler-less image
    /// as a combined image sampler is invalid.
    pub fn sampled_image(image: &GpuImage) -> Self {
        debug_assert!(
            image.sampler().is_some(),
            "sampled_image on an image with no sampler attached"
        );
        Self::Image {
            view: image.view(),
            sampler: image.sampler().unwrap_or(vk::Sampler::null()),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    pub fn kind(&self) -> BindingKind {
        match self {
            Self::Buffer { .. } => BindingKind::Buffer,
            Self::Image { .. } => BindingKind::Image,
        }
    }
}

/// Ordered binding declarations for one pipeline, immutable once built.
#[derive(Debug, Clone)]
pub struct BindingTemplate {
    kinds: Vec<BindingKind>,
    stage_flags: vk::ShaderStageFlags,
}

impl BindingTemplate {
    pub fn new(kinds: Vec<BindingKind>, stage_flags: vk::ShaderStageFlags) -> Self {
        Self { kinds, stage_flags }
    }

    pub fn kinds(&self) -> &[BindingKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Descriptor set layout bindings, slot `i` taken from kind `i`.
    pub(crate) fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'_>> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(kind.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(self.stage_flags)
            })
            .collect()
    }

    /// Push `descriptors` to set 0 in one batched call.
    ///
    /// `descriptors` must match the declared kinds in length and order;
    /// mismatches are debug assertions, matching them is the caller's
    /// contract in release builds.
    pub fn push(
        &self,
        loader: &ash::khr::push_descriptor::Device,
        cmd: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        descriptors: &[Descriptor],
    ) {
        debug_assert_eq!(
            descriptors.len(),
            self.kinds.len(),
            "descriptor count does not match the binding template"
        );

        let (buffer_infos, image_infos) = collect_infos(descriptors);
        let writes = build_writes(&self.kinds, descriptors, &buffer_infos, &image_infos);

        unsafe {
            loader.cmd_push_descriptor_set(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &writes,
            );
        }
    }
}

/// Split descriptors into the Vulkan info structs, preserving order within
/// each kind.
fn collect_infos(
    descriptors: &[Descriptor],
) -> (Vec<vk::DescriptorBufferInfo>, Vec<vk::DescriptorImageInfo>) {
    let mut buffer_infos = Vec::new();
    let mut image_infos = Vec::new();

    for descriptor in descriptors {
        match *descriptor {
            Descriptor::Buffer {
                buffer,
                offset,
                range,
            } => buffer_infos.push(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range),
            ),
            Descriptor::Image {
                view,
                sampler,
                layout,
            } => image_infos.push(
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(layout),
            ),
        }
    }

    (buffer_infos, image_infos)
}

/// Build one write per declared binding, referencing the collected infos.
fn build_writes<'a>(
    kinds: &[BindingKind],
    descriptors: &[Descriptor],
    buffer_infos: &'a [vk::DescriptorBufferInfo],
    image_infos: &'a [vk::DescriptorImageInfo],
) -> Vec<vk::WriteDescriptorSet<'a>> {
    let mut next_buffer = 0;
    let mut next_image = 0;
    let mut writes = Vec::with_capacity(descriptors.len());

    for (i, descriptor) in descriptors.iter().enumerate() {
        debug_assert_eq!(
            descriptor.kind(),
            kinds[i],
            "descriptor kind mismatch at binding {i}"
        );

        let write = vk::WriteDescriptorSet::default()
            .dst_binding(i as u32)
            .descriptor_count(1)
            .descriptor_type(descriptor.kind().descriptor_type());

        let write = match descriptor.kind() {
            BindingKind::Buffer => {
                let info = std::slice::from_ref(&buffer_infos[next_buffer]);
                next_buffer += 1;
                write.buffer_info(info)
            }
            BindingKind::Image => {
                let info = std::slice::from_ref(&image_infos[next_image]);
                next_image += 1;
                write.image_info(info)
            }
        };

        writes.push(write);
    }

    writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_layout_bindings_preserve_declaration_order() {
        let template = BindingTemplate::new(
            vec![BindingKind::Buffer, BindingKind::Image, BindingKind::Buffer],
            vk::ShaderStageFlags::VERTEX,
        );

        let bindings = template.layout_bindings();
        assert_eq!(bindings.len(), 3);
        for (i, binding) in bindings.iter().enumerate() {
            assert_eq!(binding.binding, i as u32);
            assert_eq!(binding.descriptor_count, 1);
        }
        assert_eq!(
            bindings[0].descriptor_type,
            vk::DescriptorType::STORAGE_BUFFER
        );
        assert_eq!(
            bindings[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            bindings[2].descriptor_type,
            vk::DescriptorType::STORAGE_BUFFER
        );
    }

    #[test]
    fn test_writes_land_in_declared_slots() {
        let kinds = [BindingKind::Buffer, BindingKind::Image, BindingKind::Buffer];
        let descriptors = [
            Descriptor::Buffer {
                buffer: vk::Buffer::from_raw(101),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            Descriptor::Image {
                view: vk::ImageView::from_raw(202),
                sampler: vk::Sampler::from_raw(303),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            Descriptor::Buffer {
                buffer: vk::Buffer::from_raw(404),
                offset: 16,
                range: 64,
            },
        ];

        let (buffer_infos, image_infos) = collect_infos(&descriptors);
        assert_eq!(buffer_infos.len(), 2);
        assert_eq!(image_infos.len(), 1);
        assert_eq!(buffer_infos[0].buffer, vk::Buffer::from_raw(101));
        assert_eq!(buffer_infos[1].buffer, vk::Buffer::from_raw(404));
        assert_eq!(buffer_infos[1].offset, 16);
        assert_eq!(image_infos[0].image_view, vk::ImageView::from_raw(202));

        let writes = build_writes(&kinds, &descriptors, &buffer_infos, &image_infos);
        assert_eq!(writes.len(), 3);
        for (i, write) in writes.iter().enumerate() {
            assert_eq!(write.dst_binding, i as u32);
            assert_eq!(write.descriptor_count, 1);
        }
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(
            writes[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );

        // Entry i of the caller list feeds binding i.
        unsafe {
            assert_eq!((*writes[0].p_buffer_info).buffer, vk::Buffer::from_raw(101));
            assert_eq!(
                (*writes[1].p_image_info).image_view,
                vk::ImageView::from_raw(202)
            );
            assert_eq!((*writes[2].p_buffer_info).buffer, vk::Buffer::from_raw(404));
        }
    }

    #[test]
    #[should_panic(expected = "descriptor kind mismatch")]
    fn test_kind_mismatch_asserts() {
        let kinds = [BindingKind::Image];
        let descriptors = [Descriptor::Buffer {
            buffer: vk::Buffer::from_raw(1),
            offset: 0,
            range: 4,
        }];

        let (buffer_infos, image_infos) = collect_infos(&descriptors);
        let _ = build_writes(&kinds, &descriptors, &buffer_infos, &image_infos);
    }

    #[test]
    fn test_descriptor_kind_tagging() {
        let buffer = Descriptor::Buffer {
            buffer: vk::Buffer::from_raw(1),
            offset: 0,
            range: 4,
        };
        let image = Descriptor::Image {
            view: vk::ImageView::from_raw(2),
            sampler: vk::Sampler::from_raw(3),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        assert_eq!(buffer.kind(), BindingKind::Buffer);
        assert_eq!(image.kind(), BindingKind::Image);
    }
}
