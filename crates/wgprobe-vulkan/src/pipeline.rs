//! Compute pipeline and host-visible output buffer.

use std::io::Cursor;
use std::mem::{offset_of, size_of};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use tracing::debug;
use wgprobe_core::dispatch::DispatchGeometry;
use wgprobe_core::error::{ProbeError, Result};
use wgprobe_core::pixel;

use crate::context::{VulkanContext, vk_err};

/// Specialization constants 0 to 5 of the compute shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SpecializationConstants {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub workgroup_x: u32,
    pub workgroup_y: u32,
    pub workgroup_z: u32,
}

impl SpecializationConstants {
    pub fn from_geometry(geometry: &DispatchGeometry) -> Self {
        let e = geometry.extents;
        let w = geometry.workgroup;
        Self {
            width: e.width,
            height: e.height,
            depth: e.depth,
            workgroup_x: w.x,
            workgroup_y: w.y,
            workgroup_z: w.z,
        }
    }

    fn map_entries() -> [vk::SpecializationMapEntry; 6] {
        let offsets = [
            offset_of!(Self, width),
            offset_of!(Self, height),
            offset_of!(Self, depth),
            offset_of!(Self, workgroup_x),
            offset_of!(Self, workgroup_y),
            offset_of!(Self, workgroup_z),
        ];
        let mut entries = [vk::SpecializationMapEntry::default(); 6];
        for (id, (entry, offset)) in entries.iter_mut().zip(offsets).enumerate() {
            *entry = vk::SpecializationMapEntry::default()
                .constant_id(id as u32)
                .offset(offset as u32)
                .size(size_of::<u32>());
        }
        entries
    }
}

/// Pipeline, its single storage-buffer binding and the buffer itself.
///
/// Device-level objects; [`ComputePipeline::destroy`] must run before the
/// owning [`VulkanContext`] drops.
#[derive(Debug)]
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub buffer_size: vk::DeviceSize,
    pub num_groups: [u32; 3],
}

impl ComputePipeline {
    /// Build the pipeline from a SPIR-V blob specialized for `geometry`.
    pub fn new(ctx: &VulkanContext, spirv: &[u8], geometry: &DispatchGeometry) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(spirv))
            .map_err(|e| ProbeError::Shader(format!("invalid SPIR-V: {e}")))?;
        let buffer_size = pixel::output_buffer_size(&geometry.extents)? as vk::DeviceSize;

        let mut this = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            buffer_size,
            num_groups: geometry.num_groups(),
        };
        if let Err(err) = this.build(ctx, &code, geometry) {
            this.destroy(&ctx.device);
            return Err(err);
        }
        debug!(
            bytes = buffer_size,
            groups = ?this.num_groups,
            "compute pipeline ready"
        );
        Ok(this)
    }

    fn build(&mut self, ctx: &VulkanContext, code: &[u32], geometry: &DispatchGeometry) -> Result<()> {
        let device = &ctx.device;

        // SAFETY: every create-info below only references locals that
        // outlive the call; handles are recorded in self for cleanup.
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(self.buffer_size)
                .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            self.buffer = device
                .create_buffer(&buffer_info, None)
                .map_err(vk_err("vkCreateBuffer"))?;
            let requirements = device.get_buffer_memory_requirements(self.buffer);
            let memory_type = ctx.find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            self.memory = device
                .allocate_memory(&alloc_info, None)
                .map_err(vk_err("vkAllocateMemory"))?;
            device
                .bind_buffer_memory(self.buffer, self.memory, 0)
                .map_err(vk_err("vkBindBufferMemory"))?;

            let bindings = [vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)];
            self.set_layout = device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                    None,
                )
                .map_err(vk_err("vkCreateDescriptorSetLayout"))?;

            let pool_sizes = [vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)];
            self.descriptor_pool = device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default()
                        .max_sets(1)
                        .pool_sizes(&pool_sizes),
                    None,
                )
                .map_err(vk_err("vkCreateDescriptorPool"))?;

            let set_layouts = [self.set_layout];
            let sets = device
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(self.descriptor_pool)
                        .set_layouts(&set_layouts),
                )
                .map_err(vk_err("vkAllocateDescriptorSets"))?;
            self.descriptor_set = sets[0];

            let buffer_infos = [vk::DescriptorBufferInfo::default()
                .buffer(self.buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE)];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&buffer_infos);
            device.update_descriptor_sets(&[write], &[]);

            self.layout = device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
                    None,
                )
                .map_err(vk_err("vkCreatePipelineLayout"))?;

            let module = device
                .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)
                .map_err(|e| ProbeError::Shader(format!("vkCreateShaderModule: {e:?}")))?;

            let constants = SpecializationConstants::from_geometry(geometry);
            let map_entries = SpecializationConstants::map_entries();
            let specialization = vk::SpecializationInfo::default()
                .map_entries(&map_entries)
                .data(bytemuck::bytes_of(&constants));
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(c"main")
                .specialization_info(&specialization);
            let pipeline_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(self.layout);
            let created = device.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            );
            device.destroy_shader_module(module, None);
            let pipelines = created.map_err(|(_, e)| {
                ProbeError::Shader(format!("vkCreateComputePipelines: {e:?}"))
            })?;
            self.pipeline = pipelines[0];
        }
        Ok(())
    }

    /// Copy the whole output buffer to host memory.
    pub fn read_bytes(&self, device: &ash::Device) -> Result<Vec<u8>> {
        let len = self.buffer_size as usize;
        // SAFETY: memory is host-visible and coherent, unmapped, and the
        // caller has waited on the fence of the last dispatch.
        unsafe {
            let ptr = device
                .map_memory(self.memory, 0, self.buffer_size, vk::MemoryMapFlags::empty())
                .map_err(vk_err("vkMapMemory"))?;
            let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec();
            device.unmap_memory(self.memory);
            Ok(bytes)
        }
    }

    /// Destroy every handle created so far. Null handles are skipped.
    pub fn destroy(&mut self, device: &ash::Device) {
        // SAFETY: the device is idle or these objects were never submitted.
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.set_layout, None);
            }
            if self.buffer != vk::Buffer::null() {
                device.destroy_buffer(self.buffer, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
        self.descriptor_pool = vk::DescriptorPool::null();
        self.descriptor_set = vk::DescriptorSet::null();
        self.set_layout = vk::DescriptorSetLayout::null();
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgprobe_core::dispatch::{DispatchExtents, WorkgroupSize};

    #[test]
    fn specialization_constants_follow_declaration_order() {
        let geometry = DispatchGeometry::new(
            DispatchExtents {
                width: 640,
                height: 480,
                depth: 1,
            },
            WorkgroupSize { x: 16, y: 8, z: 1 },
        )
        .expect("geometry");
        let constants = SpecializationConstants::from_geometry(&geometry);
        let words: [u32; 6] = bytemuck::cast(constants);
        assert_eq!(words, [640, 480, 1, 16, 8, 1]);

        let entries = SpecializationConstants::map_entries();
        for (id, entry) in entries.iter().enumerate() {
            assert_eq!(entry.constant_id, id as u32);
            assert_eq!(entry.offset, 4 * id as u32);
            assert_eq!(entry.size, 4);
        }
    }
}
