//! Actually-used feature detection
//!
//! Some applications pass the whole feature struct they queried straight
//! back to the driver instead of enabling only what they use, which makes
//! traces less portable than they need to be. These atomic mirrors of the
//! core feature blocks collect what was really used during capture; at
//! finalization the requested sets are reduced to the observed ones.
//!
//! Atomics use relaxed ordering throughout: bits only ever go from clear to
//! set, and the reducer runs single-threaded after capture.

use {
    ash::vk,
    std::sync::atomic::{AtomicBool, Ordering},
};

#[inline]
fn mark(flag: &AtomicBool) {
    flag.store(true, Ordering::Relaxed);
}

macro_rules! feature_set {
    ($name:ident, $vk:ty, { $($field:ident),+ $(,)? }) => {
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicBool,)+
        }

        impl $name {
            /// AND the requested feature set with the observed-used set,
            /// clearing bits that were never actually used.
            pub fn adjust(&self, requested: &mut $vk) {
                $(
                    if requested.$field != vk::FALSE && !self.$field.load(Ordering::Relaxed) {
                        requested.$field = vk::FALSE;
                    }
                )+
            }

            /// Number of features observed in use.
            pub fn count_used(&self) -> usize {
                let mut used = 0;
                $(
                    if self.$field.load(Ordering::Relaxed) {
                        used += 1;
                    }
                )+
                used
            }
        }
    };
}

feature_set!(UsedFeatures10, vk::PhysicalDeviceFeatures, {
    robust_buffer_access,
    full_draw_index_uint32,
    image_cube_array,
    independent_blend,
    geometry_shader,
    tessellation_shader,
    sample_rate_shading,
    dual_src_blend,
    logic_op,
    multi_draw_indirect,
    draw_indirect_first_instance,
    depth_clamp,
    depth_bias_clamp,
    fill_mode_non_solid,
    depth_bounds,
    wide_lines,
    large_points,
    alpha_to_one,
    multi_viewport,
    sampler_anisotropy,
    texture_compression_etc2,
    texture_compression_astc_ldr,
    texture_compression_bc,
    occlusion_query_precise,
    pipeline_statistics_query,
    vertex_pipeline_stores_and_atomics,
    fragment_stores_and_atomics,
    shader_tessellation_and_geometry_point_size,
    shader_image_gather_extended,
    shader_storage_image_extended_formats,
    shader_storage_image_multisample,
    shader_storage_image_read_without_format,
    shader_storage_image_write_without_format,
    shader_uniform_buffer_array_dynamic_indexing,
    shader_sampled_image_array_dynamic_indexing,
    shader_storage_buffer_array_dynamic_indexing,
    shader_storage_image_array_dynamic_indexing,
    shader_clip_distance,
    shader_cull_distance,
    shader_float64,
    shader_int64,
    shader_int16,
    shader_resource_residency,
    shader_resource_min_lod,
    sparse_binding,
    sparse_residency_buffer,
    sparse_residency_image2_d,
    sparse_residency_image3_d,
    sparse_residency2_samples,
    sparse_residency4_samples,
    sparse_residency8_samples,
    sparse_residency16_samples,
    sparse_residency_aliased,
    variable_multisample_rate,
    inherited_queries,
});

feature_set!(UsedFeatures11, vk::PhysicalDeviceVulkan11Features, {
    storage_buffer16_bit_access,
    uniform_and_storage_buffer16_bit_access,
    storage_push_constant16,
    storage_input_output16,
    multiview,
    multiview_geometry_shader,
    multiview_tessellation_shader,
    variable_pointers_storage_buffer,
    variable_pointers,
    protected_memory,
    sampler_ycbcr_conversion,
    shader_draw_parameters,
});

feature_set!(UsedFeatures12, vk::PhysicalDeviceVulkan12Features, {
    sampler_mirror_clamp_to_edge,
    draw_indirect_count,
    storage_buffer8_bit_access,
    uniform_and_storage_buffer8_bit_access,
    storage_push_constant8,
    shader_buffer_int64_atomics,
    shader_shared_int64_atomics,
    shader_float16,
    shader_int8,
    descriptor_indexing,
    shader_input_attachment_array_dynamic_indexing,
    shader_uniform_texel_buffer_array_dynamic_indexing,
    shader_storage_texel_buffer_array_dynamic_indexing,
    shader_uniform_buffer_array_non_uniform_indexing,
    shader_sampled_image_array_non_uniform_indexing,
    shader_storage_buffer_array_non_uniform_indexing,
    shader_storage_image_array_non_uniform_indexing,
    shader_input_attachment_array_non_uniform_indexing,
    shader_uniform_texel_buffer_array_non_uniform_indexing,
    shader_storage_texel_buffer_array_non_uniform_indexing,
    descriptor_binding_uniform_buffer_update_after_bind,
    descriptor_binding_sampled_image_update_after_bind,
    descriptor_binding_storage_image_update_after_bind,
    descriptor_binding_storage_buffer_update_after_bind,
    descriptor_binding_uniform_texel_buffer_update_after_bind,
    descriptor_binding_storage_texel_buffer_update_after_bind,
    descriptor_binding_update_unused_while_pending,
    descriptor_binding_partially_bound,
    descriptor_binding_variable_descriptor_count,
    runtime_descriptor_array,
    sampler_filter_minmax,
    scalar_block_layout,
    imageless_framebuffer,
    uniform_buffer_standard_layout,
    shader_subgroup_extended_types,
    separate_depth_stencil_layouts,
    host_query_reset,
    timeline_semaphore,
    buffer_device_address,
    buffer_device_address_capture_replay,
    buffer_device_address_multi_device,
    vulkan_memory_model,
    vulkan_memory_model_device_scope,
    vulkan_memory_model_availability_visibility_chains,
    shader_output_viewport_index,
    shader_output_layer,
    subgroup_broadcast_dynamic_id,
});

feature_set!(UsedFeatures13, vk::PhysicalDeviceVulkan13Features, {
    robust_image_access,
    inline_uniform_block,
    descriptor_binding_inline_uniform_block_update_after_bind,
    pipeline_creation_cache_control,
    private_data,
    shader_demote_to_helper_invocation,
    shader_terminate_invocation,
    subgroup_size_control,
    compute_full_subgroups,
    synchronization2,
    texture_compression_astc_hdr,
    shader_zero_initialize_workgroup_memory,
    dynamic_rendering,
    shader_integer_dot_product,
    maintenance4,
});

/// All observed feature usage of one capture. Reentrant safe.
#[derive(Debug, Default)]
pub struct FeatureUsage {
    pub core10: UsedFeatures10,
    pub vulkan11: UsedFeatures11,
    pub vulkan12: UsedFeatures12,
    pub vulkan13: UsedFeatures13,
}

impl FeatureUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A color blend attachment referencing a SRC1 factor uses dual-source
    /// blending.
    pub fn check_blend_factor(&self, factor: vk::BlendFactor) {
        if matches!(
            factor,
            vk::BlendFactor::SRC1_COLOR
                | vk::BlendFactor::ONE_MINUS_SRC1_COLOR
                | vk::BlendFactor::SRC1_ALPHA
                | vk::BlendFactor::ONE_MINUS_SRC1_ALPHA
        ) {
            mark(&self.core10.dual_src_blend);
        }
    }

    pub fn check_rasterization(
        &self,
        depth_clamp_enable: bool,
        depth_bias_clamp: f32,
        polygon_mode: vk::PolygonMode,
        line_width: f32,
    ) {
        if depth_clamp_enable {
            mark(&self.core10.depth_clamp);
        }
        if depth_bias_clamp != 0.0 {
            mark(&self.core10.depth_bias_clamp);
        }
        if polygon_mode != vk::PolygonMode::FILL {
            mark(&self.core10.fill_mode_non_solid);
        }
        if line_width != 1.0 {
            mark(&self.core10.wide_lines);
        }
    }

    pub fn check_depth_bounds(&self, depth_bounds_test_enable: bool) {
        if depth_bounds_test_enable {
            mark(&self.core10.depth_bounds);
        }
    }

    pub fn check_logic_op(&self, logic_op_enable: bool) {
        if logic_op_enable {
            mark(&self.core10.logic_op);
        }
    }

    pub fn check_sampler(&self, anisotropy_enable: bool) {
        if anisotropy_enable {
            mark(&self.core10.sampler_anisotropy);
        }
    }

    pub fn check_shader_stage(&self, stage: vk::ShaderStageFlags) {
        if stage.contains(vk::ShaderStageFlags::GEOMETRY) {
            mark(&self.core10.geometry_shader);
        }
        if stage.intersects(
            vk::ShaderStageFlags::TESSELLATION_CONTROL
                | vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        ) {
            mark(&self.core10.tessellation_shader);
        }
    }

    pub fn check_index_type(&self, ty: vk::IndexType) {
        if ty == vk::IndexType::UINT32 {
            mark(&self.core10.full_draw_index_uint32);
        }
    }

    pub fn check_draw_indirect(&self, draw_count: u32, first_instance: u32) {
        if draw_count > 1 {
            mark(&self.core10.multi_draw_indirect);
        }
        if first_instance != 0 {
            mark(&self.core10.draw_indirect_first_instance);
        }
    }

    pub fn check_image_view_type(&self, view_type: vk::ImageViewType) {
        if view_type == vk::ImageViewType::CUBE_ARRAY {
            mark(&self.core10.image_cube_array);
        }
    }

    pub fn check_query_type(&self, ty: vk::QueryType, flags: vk::QueryControlFlags) {
        if ty == vk::QueryType::PIPELINE_STATISTICS {
            mark(&self.core10.pipeline_statistics_query);
        }
        if ty == vk::QueryType::OCCLUSION && flags.contains(vk::QueryControlFlags::PRECISE) {
            mark(&self.core10.occlusion_query_precise);
        }
    }

    pub fn check_buffer_usage(&self, usage: vk::BufferUsageFlags) {
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            mark(&self.vulkan12.buffer_device_address);
        }
    }

    pub fn check_multiview(&self, view_mask: u32) {
        if view_mask != 0 {
            mark(&self.vulkan11.multiview);
        }
    }

    pub fn check_rendering_info(&self, dynamic_rendering: bool) {
        if dynamic_rendering {
            mark(&self.vulkan13.dynamic_rendering);
        }
    }

    pub fn check_timeline_semaphore(&self, ty: vk::SemaphoreType) {
        if ty == vk::SemaphoreType::TIMELINE {
            mark(&self.vulkan12.timeline_semaphore);
        }
    }
}
