//! Device entry points grouped by object category.
//!
//! `Device` implements every trait and also exposes the methods inherently,
//! so the traits only need importing for dynamic dispatch.

use crate::{
    BindGroup, BindGroupDesc, BindGroupLayout, BindGroupLayoutDesc, Buffer, BufferDesc,
    CommandEncoder, CommandEncoderDesc, ComputePipeline, ComputePipelineDesc, ExternalTexture,
    ExternalTextureDesc, PipelineLayout, PipelineLayoutDesc, QuerySet, QuerySetDesc,
    RenderBundleEncoder, RenderBundleEncoderDesc, RenderPipeline, RenderPipelineDesc, Sampler,
    SamplerDesc, ShaderModule, ShaderModuleDesc, Texture, TextureDesc,
};

pub trait ResourceDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Buffer;
    fn create_texture(&self, desc: &TextureDesc) -> Texture;
    fn create_sampler(&self, desc: &SamplerDesc) -> Sampler;
    fn create_query_set(&self, desc: &QuerySetDesc) -> QuerySet;
    fn create_external_texture(&self, desc: &ExternalTextureDesc) -> ExternalTexture;
}

pub trait BindingDevice {
    fn create_bind_group_layout(&self, desc: &BindGroupLayoutDesc) -> BindGroupLayout;
    fn create_bind_group(&self, desc: &BindGroupDesc) -> BindGroup;
    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> PipelineLayout;
}

pub trait ShaderDevice {
    /// Compiles WGSL. A module that fails to compile is still returned and
    /// keeps its diagnostics for `get_compilation_info`.
    fn create_shader_module(&self, desc: &ShaderModuleDesc) -> ShaderModule;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> ComputePipeline;
    fn create_render_pipeline(&self, desc: &RenderPipelineDesc) -> RenderPipeline;
}

pub trait CommandDevice {
    fn create_command_encoder(&self, desc: &CommandEncoderDesc) -> CommandEncoder;
    fn create_render_bundle_encoder(&self, desc: &RenderBundleEncoderDesc) -> RenderBundleEncoder;
}
