//! Screen-space outlines built on a compute pass graph
//!
//! The effect reads a coverage mask (alpha above one half counts as covered),
//! floods the distance to the nearest covered texel with a jump flood, and
//! paints every uncovered texel within the outline width. An optional
//! separable box blur of the outlines is composited underneath them as glow.
//!
//! The output image must be a `Rgba16Float` storage texture the size of the
//! mask. Seed coordinates are stored as 16-bit floats, which represent texel
//! coordinates exactly up to 2048.

use pass_graph::{Buffer, ComputeDevice, ConstantId, DeviceError, Extent, Graph, GraphError, ImageHandle, ShaderId, ShaderPool};

/// Path of every embedded WGSL program, in pipeline order
pub const PROGRAMS: [&str; 5] = ["jfa_init.wgsl", "jfa_step.wgsl", "jfa_outlines.wgsl", "box_blur.wgsl", "composite.wgsl"];

/// Returns the embedded source of the program at `path`
pub fn shader_source(path: &str) -> Option<&'static str> {
    match path {
        "jfa_init.wgsl" => Some(include_str!("../shaders/jfa_init.wgsl")),
        "jfa_step.wgsl" => Some(include_str!("../shaders/jfa_step.wgsl")),
        "jfa_outlines.wgsl" => Some(include_str!("../shaders/jfa_outlines.wgsl")),
        "box_blur.wgsl" => Some(include_str!("../shaders/box_blur.wgsl")),
        "composite.wgsl" => Some(include_str!("../shaders/composite.wgsl")),
        _ => None,
    }
}

/// A shader pool serving the embedded programs
pub fn shader_pool() -> ShaderPool {
    ShaderPool::new(|path: &str| {
        shader_source(path)
            .map(str::to_string)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no embedded shader named {path}")))
    })
}

/// Jump distances of the flood, halving down to one texel
///
/// The first jump is the smallest power of two not below `width`, so seeds up
/// to `width` texels away are always reached.
pub fn jfa_step_sizes(width: u32) -> Vec<i32> {
    let steps = width.max(1).next_power_of_two().trailing_zeros() + 1;
    (0..steps).rev().map(|exponent| 1 << exponent).collect()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct StepParams {
    step: i32,
    pad: [i32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct OutlineParams {
    color: [f32; 4],
    width: f32,
    pad: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    radius: i32,
    horizontal: u32,
    pad: [u32; 2],
}

/// Appearance of the outlines
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlineSettings {
    /// Outline width in texels
    pub width: u32,
    /// Box blur radius of the glow; zero disables the glow passes
    pub glow_radius: u32,
    /// Straight-alpha RGBA outline color
    pub color: [f32; 4],
}

impl Default for OutlineSettings {
    fn default() -> Self {
        Self {
            width: 4,
            glow_radius: 0,
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutlinesError {
    #[error("outline width must be at least one texel")]
    ZeroWidth,
    #[error("outline width {0} exceeds the 2048 texels seed coordinates can address")]
    WidthTooLarge(u32),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<DeviceError> for OutlinesError {
    fn from(error: DeviceError) -> Self {
        Self::Graph(error.into())
    }
}

/// The passes of an outline graph
#[derive(Debug, Clone)]
pub struct OutlinePasses {
    pub init: ShaderId,
    pub steps: Vec<ShaderId>,
    pub outlines: ShaderId,
    /// Horizontal and vertical blur, present when glow is enabled
    pub blur: Option<(ShaderId, ShaderId)>,
    pub composite: Option<ShaderId>,
}

/// The outline effect as a compute graph
///
/// Graph input 0 is the coverage mask, graph output 0 receives the outlines.
#[derive(Debug)]
pub struct OutlinesGraph {
    graph: Graph,
    settings: OutlineSettings,
    passes: OutlinePasses,
    outline_params: ConstantId,
}

impl OutlinesGraph {
    /// Creates every pass and declares the arcs between them
    pub fn new(device: &mut dyn ComputeDevice, pool: &mut ShaderPool, settings: OutlineSettings) -> Result<Self, OutlinesError> {
        if settings.width == 0 {
            return Err(OutlinesError::ZeroWidth);
        }
        if settings.width > 2048 {
            return Err(OutlinesError::WidthTooLarge(settings.width));
        }

        let mut graph = Graph::new();
        match Self::declare(&mut graph, device, pool, &settings) {
            Ok((passes, outline_params)) => {
                tracing::debug!(width = settings.width, glow_radius = settings.glow_radius, steps = passes.steps.len(), "created outlines graph");
                Ok(Self {
                    graph,
                    settings,
                    passes,
                    outline_params,
                })
            }
            Err(error) => {
                graph.cleanup(device, pool);
                Err(error.into())
            }
        }
    }

    fn declare(graph: &mut Graph, device: &mut dyn ComputeDevice, pool: &mut ShaderPool, settings: &OutlineSettings) -> Result<(OutlinePasses, ConstantId), GraphError> {
        let init = graph.create_shader(device, pool, "jfa_init.wgsl")?;
        graph.add_input_arc(0, init, 0)?;

        let mut steps = Vec::new();
        let mut previous = init;
        for step in jfa_step_sizes(settings.width) {
            let pass = graph.create_shader(device, pool, "jfa_step.wgsl")?;
            let params = Buffer::from_pod(device, &StepParams { step, pad: [0; 3] })?;
            let params = graph.add_constant(params);
            graph.bind_constant(device, pass, 2, params)?;
            graph.add_shader_arc(previous, 1, pass, 0)?;

            steps.push(pass);
            previous = pass;
        }

        let outlines = graph.create_shader(device, pool, "jfa_outlines.wgsl")?;
        graph.add_shader_arc(previous, 1, outlines, 0)?;
        graph.add_input_arc(0, outlines, 1)?;
        let params = Buffer::from_pod(device, &outline_params(settings))?;
        let outline_params = graph.add_constant(params);
        graph.bind_constant(device, outlines, 3, outline_params)?;

        if settings.glow_radius == 0 {
            graph.add_output_arc(outlines, 2, 0)?;
            let passes = OutlinePasses {
                init,
                steps,
                outlines,
                blur: None,
                composite: None,
            };
            return Ok((passes, outline_params));
        }

        let radius = settings.glow_radius as i32;
        let mut blur = [init; 2];
        let mut previous = (outlines, 2);
        for (pass, horizontal) in blur.iter_mut().zip([1, 0]) {
            *pass = graph.create_shader(device, pool, "box_blur.wgsl")?;
            let params = Buffer::from_pod(device, &BlurParams { radius, horizontal, pad: [0; 2] })?;
            let params = graph.add_constant(params);
            graph.bind_constant(device, *pass, 2, params)?;
            graph.add_shader_arc(previous.0, previous.1, *pass, 0)?;
            previous = (*pass, 1);
        }

        let composite = graph.create_shader(device, pool, "composite.wgsl")?;
        graph.add_shader_arc(outlines, 2, composite, 0)?;
        graph.add_shader_arc(blur[1], 1, composite, 1)?;
        graph.add_output_arc(composite, 2, 0)?;

        let passes = OutlinePasses {
            init,
            steps,
            outlines,
            blur: Some((blur[0], blur[1])),
            composite: Some(composite),
        };
        Ok((passes, outline_params))
    }

    pub fn settings(&self) -> &OutlineSettings {
        &self.settings
    }

    pub fn passes(&self) -> &OutlinePasses {
        &self.passes
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Changes the outline color without rebuilding
    pub fn set_color(&mut self, device: &mut dyn ComputeDevice, color: [f32; 4]) -> Result<(), OutlinesError> {
        self.settings.color = color;
        let params = outline_params(&self.settings);
        self.graph.write_constant(device, self.outline_params, bytemuck::bytes_of(&params))?;
        Ok(())
    }

    /// Draws the outlines of `mask` into `output`
    ///
    /// The graph is sized to the mask and built on first use. Later calls with
    /// a different mask or output rebind them, resizing the intermediates when
    /// the mask size changes.
    pub fn run(&mut self, device: &mut dyn ComputeDevice, mask: ImageHandle, output: ImageHandle) -> Result<(), OutlinesError> {
        let size: Extent = device.image_size(mask).ok_or(DeviceError::InvalidHandle { kind: "image" })?;

        self.graph.set_processing_size(device, size)?;
        self.graph.bind_input(device, 0, mask)?;
        self.graph.bind_output(device, 0, output)?;

        if !self.graph.is_built() {
            self.graph.build(device)?;
        }

        self.graph.run(device)?;
        Ok(())
    }

    /// Releases every device resource of the effect
    ///
    /// The mask and output images are left untouched.
    pub fn cleanup(&mut self, device: &mut dyn ComputeDevice, pool: &mut ShaderPool) {
        self.graph.cleanup(device, pool);
    }
}

fn outline_params(settings: &OutlineSettings) -> OutlineParams {
    OutlineParams {
        color: settings.color,
        width: settings.width as f32,
        pad: [0.0; 3],
    }
}
