//! Global rendering options, mirrored from the `options` node into a
//! plain snapshot the render passes read.

use crate::math::Vec4;
use crate::nodesys::{NodeSystem, StorageClass};
use ember_db::{Tag, Value, ValueType};

/// Reconstruction filters of the sample accumulator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Filter {
    Box,
    Triangle,
    CatmullRom,
    Gaussian,
    Sinc,
}

/// Kernel of the photon irradiance estimate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CausticFilter {
    None,
    Box,
    Cone,
    Gaussian,
}

#[derive(Clone, Debug)]
pub struct Options {
    pub contrast: Vec4,
    pub min_samples: i32,
    pub max_samples: i32,
    pub bucket_size: u32,
    pub filter: Filter,
    pub filter_size: f32,
    pub motion: bool,
    pub motion_segments: i32,
    pub trace_reflect_depth: i32,
    pub trace_refract_depth: i32,
    pub trace_sum_depth: i32,
    pub acceleration: i32,
    pub bsp_size: usize,
    pub bsp_depth: i32,
    pub exposure_gain: f32,
    pub exposure_gamma: f32,
    pub quantize_one: f32,
    pub quantize_min: f32,
    pub quantize_max: f32,
    pub quantize_dither_amplitude: f32,
    pub shutter_open: f32,
    pub shutter_close: f32,
    pub lens: bool,
    pub volume: bool,
    pub geometry: bool,
    pub displace: bool,
    pub imager: bool,
    pub caustic: bool,
    pub caustic_photons: i32,
    pub caustic_samples: i32,
    pub caustic_radius: f32,
    pub caustic_filter: CausticFilter,
    pub caustic_filter_const: f32,
    pub photon_reflect_depth: i32,
    pub photon_refract_depth: i32,
    pub photon_decay: f32,
    pub globillum: bool,
    pub globillum_photons: i32,
    pub globillum_samples: i32,
    pub globillum_radius: f32,
    pub finalgather: bool,
    pub finalgather_rays: u32,
    pub finalgather_samples: i32,
    pub finalgather_density: f32,
    pub finalgather_radius: f32,
    pub finalgather_falloff: bool,
    pub finalgather_falloff_start: f32,
    pub finalgather_falloff_stop: f32,
    pub finalgather_filter_size: f32,
    pub finalgather_reflect_depth: i32,
    pub finalgather_refract_depth: i32,
    pub finalgather_diffuse_bounces: i32,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            contrast: Vec4::new(0.05, 0.05, 0.05, 0.05),
            min_samples: 0,
            max_samples: 2,
            bucket_size: 48,
            filter: Filter::Box,
            filter_size: 1.0,
            motion: true,
            motion_segments: 5,
            trace_reflect_depth: 6,
            trace_refract_depth: 6,
            trace_sum_depth: 6,
            acceleration: 1,
            bsp_size: 10,
            bsp_depth: 30,
            exposure_gain: 1.0,
            exposure_gamma: 1.0,
            quantize_one: 255.0,
            quantize_min: 0.0,
            quantize_max: 255.0,
            quantize_dither_amplitude: 0.5,
            shutter_open: 0.0,
            shutter_close: 1.0,
            lens: true,
            volume: true,
            geometry: true,
            displace: true,
            imager: true,
            caustic: false,
            caustic_photons: 100000,
            caustic_samples: 100,
            caustic_radius: 0.0,
            caustic_filter: CausticFilter::Cone,
            caustic_filter_const: 1.1,
            photon_reflect_depth: 5,
            photon_refract_depth: 5,
            photon_decay: 2.0,
            globillum: false,
            globillum_photons: 10000,
            globillum_samples: 100,
            globillum_radius: 0.0,
            finalgather: false,
            finalgather_rays: 500,
            finalgather_samples: 30,
            finalgather_density: 1.0,
            finalgather_radius: 0.0,
            finalgather_falloff: false,
            finalgather_falloff_start: 0.0,
            finalgather_falloff_stop: 0.0,
            finalgather_filter_size: 4.0,
            finalgather_reflect_depth: 1,
            finalgather_refract_depth: 1,
            finalgather_diffuse_bounces: 0,
        }
    }
}

/// Declares the `options` node desc.
pub fn install_options_desc(nodesys: &NodeSystem) {
    let d = Options::default();
    let desc = nodesys.node_desc("options");
    let add = |name: &str, ty: ValueType, value: Value| {
        nodesys.desc_add_parameter(desc, StorageClass::Constant, ty, name, value);
    };
    add(
        "contrast",
        ValueType::Vec4,
        Value::Vec4([d.contrast.x, d.contrast.y, d.contrast.z, d.contrast.w]),
    );
    add("min_samples", ValueType::Int, Value::Int(d.min_samples));
    add("max_samples", ValueType::Int, Value::Int(d.max_samples));
    add("bucket_size", ValueType::Int, Value::Int(d.bucket_size as i32));
    add("filter", ValueType::Int, Value::Int(0));
    add("filter_size", ValueType::Scalar, Value::Scalar(d.filter_size));
    add("motion", ValueType::Bool, Value::Bool(d.motion));
    add("motion_segments", ValueType::Int, Value::Int(d.motion_segments));
    add(
        "trace_reflect_depth",
        ValueType::Int,
        Value::Int(d.trace_reflect_depth),
    );
    add(
        "trace_refract_depth",
        ValueType::Int,
        Value::Int(d.trace_refract_depth),
    );
    add("trace_sum_depth", ValueType::Int, Value::Int(d.trace_sum_depth));
    add("acceleration", ValueType::Int, Value::Int(d.acceleration));
    add("bsp_size", ValueType::Int, Value::Int(d.bsp_size as i32));
    add("bsp_depth", ValueType::Int, Value::Int(d.bsp_depth));
    add("exposure_gain", ValueType::Scalar, Value::Scalar(d.exposure_gain));
    add(
        "exposure_gamma",
        ValueType::Scalar,
        Value::Scalar(d.exposure_gamma),
    );
    add("quantize_one", ValueType::Scalar, Value::Scalar(d.quantize_one));
    add("quantize_min", ValueType::Scalar, Value::Scalar(d.quantize_min));
    add("quantize_max", ValueType::Scalar, Value::Scalar(d.quantize_max));
    add(
        "quantize_dither_amplitude",
        ValueType::Scalar,
        Value::Scalar(d.quantize_dither_amplitude),
    );
    add("shutter_open", ValueType::Scalar, Value::Scalar(d.shutter_open));
    add("shutter_close", ValueType::Scalar, Value::Scalar(d.shutter_close));
    add("caustic", ValueType::Bool, Value::Bool(d.caustic));
    add("caustic_photons", ValueType::Int, Value::Int(d.caustic_photons));
    add("caustic_samples", ValueType::Int, Value::Int(d.caustic_samples));
    add("caustic_radius", ValueType::Scalar, Value::Scalar(d.caustic_radius));
    add("caustic_filter", ValueType::Int, Value::Int(2));
    add(
        "caustic_filter_const",
        ValueType::Scalar,
        Value::Scalar(d.caustic_filter_const),
    );
    add(
        "photon_reflect_depth",
        ValueType::Int,
        Value::Int(d.photon_reflect_depth),
    );
    add(
        "photon_refract_depth",
        ValueType::Int,
        Value::Int(d.photon_refract_depth),
    );
    add("photon_decay", ValueType::Scalar, Value::Scalar(d.photon_decay));
    add("globillum", ValueType::Bool, Value::Bool(d.globillum));
    add(
        "globillum_photons",
        ValueType::Int,
        Value::Int(d.globillum_photons),
    );
    add(
        "globillum_samples",
        ValueType::Int,
        Value::Int(d.globillum_samples),
    );
    add(
        "globillum_radius",
        ValueType::Scalar,
        Value::Scalar(d.globillum_radius),
    );
    add("finalgather", ValueType::Bool, Value::Bool(d.finalgather));
    add(
        "finalgather_rays",
        ValueType::Int,
        Value::Int(d.finalgather_rays as i32),
    );
    add(
        "finalgather_samples",
        ValueType::Int,
        Value::Int(d.finalgather_samples),
    );
    add(
        "finalgather_density",
        ValueType::Scalar,
        Value::Scalar(d.finalgather_density),
    );
    add(
        "finalgather_radius",
        ValueType::Scalar,
        Value::Scalar(d.finalgather_radius),
    );
    add(
        "finalgather_falloff",
        ValueType::Bool,
        Value::Bool(d.finalgather_falloff),
    );
    add(
        "finalgather_falloff_start",
        ValueType::Scalar,
        Value::Scalar(d.finalgather_falloff_start),
    );
    add(
        "finalgather_falloff_stop",
        ValueType::Scalar,
        Value::Scalar(d.finalgather_falloff_stop),
    );
    add(
        "finalgather_filter_size",
        ValueType::Scalar,
        Value::Scalar(d.finalgather_filter_size),
    );
    nodesys.end_node_desc(desc);
}

fn get_int(nodesys: &NodeSystem, node: Tag, name: &str, default: i32) -> i32 {
    match nodesys.db.read::<crate::nodesys::Node>(node).get_parameter(name) {
        Some(v) => match v.cast(ValueType::Int) {
            Value::Int(i) => i,
            _ => default,
        },
        None => default,
    }
}

fn get_scalar(nodesys: &NodeSystem, node: Tag, name: &str, default: f32) -> f32 {
    match nodesys.db.read::<crate::nodesys::Node>(node).get_parameter(name) {
        Some(v) => match v.cast(ValueType::Scalar) {
            Value::Scalar(s) => s,
            _ => default,
        },
        None => default,
    }
}

fn get_bool(nodesys: &NodeSystem, node: Tag, name: &str, default: bool) -> bool {
    match nodesys.db.read::<crate::nodesys::Node>(node).get_parameter(name) {
        Some(v) => match v.cast(ValueType::Bool) {
            Value::Bool(b) => b,
            _ => default,
        },
        None => default,
    }
}

impl Options {
    /// Snapshot of a committed `options` node.
    pub fn from_node(nodesys: &NodeSystem, node: Tag) -> Options {
        let mut o = Options::default();
        if let Some(Value::Vec4(c)) = nodesys
            .db
            .read::<crate::nodesys::Node>(node)
            .get_parameter("contrast")
        {
            o.contrast = Vec4::new(c[0], c[1], c[2], c[3]);
        }
        o.min_samples = get_int(nodesys, node, "min_samples", o.min_samples);
        o.max_samples = get_int(nodesys, node, "max_samples", o.max_samples);
        o.bucket_size = get_int(nodesys, node, "bucket_size", o.bucket_size as i32).max(1) as u32;
        o.filter = match get_int(nodesys, node, "filter", 0) {
            1 => Filter::Triangle,
            2 => Filter::CatmullRom,
            3 => Filter::Gaussian,
            4 => Filter::Sinc,
            _ => Filter::Box,
        };
        o.filter_size = get_scalar(nodesys, node, "filter_size", o.filter_size);
        o.motion = get_bool(nodesys, node, "motion", o.motion);
        o.motion_segments = get_int(nodesys, node, "motion_segments", o.motion_segments);
        o.trace_reflect_depth =
            get_int(nodesys, node, "trace_reflect_depth", o.trace_reflect_depth);
        o.trace_refract_depth =
            get_int(nodesys, node, "trace_refract_depth", o.trace_refract_depth);
        o.trace_sum_depth = get_int(nodesys, node, "trace_sum_depth", o.trace_sum_depth);
        o.acceleration = get_int(nodesys, node, "acceleration", o.acceleration);
        o.bsp_size = get_int(nodesys, node, "bsp_size", o.bsp_size as i32).max(1) as usize;
        o.bsp_depth = get_int(nodesys, node, "bsp_depth", o.bsp_depth);
        o.exposure_gain = get_scalar(nodesys, node, "exposure_gain", o.exposure_gain);
        o.exposure_gamma = get_scalar(nodesys, node, "exposure_gamma", o.exposure_gamma);
        o.quantize_one = get_scalar(nodesys, node, "quantize_one", o.quantize_one);
        o.quantize_min = get_scalar(nodesys, node, "quantize_min", o.quantize_min);
        o.quantize_max = get_scalar(nodesys, node, "quantize_max", o.quantize_max);
        o.quantize_dither_amplitude = get_scalar(
            nodesys,
            node,
            "quantize_dither_amplitude",
            o.quantize_dither_amplitude,
        );
        o.shutter_open = get_scalar(nodesys, node, "shutter_open", o.shutter_open);
        o.shutter_close = get_scalar(nodesys, node, "shutter_close", o.shutter_close);
        o.caustic = get_bool(nodesys, node, "caustic", o.caustic);
        o.caustic_photons = get_int(nodesys, node, "caustic_photons", o.caustic_photons);
        o.caustic_samples = get_int(nodesys, node, "caustic_samples", o.caustic_samples);
        o.caustic_radius = get_scalar(nodesys, node, "caustic_radius", o.caustic_radius);
        o.caustic_filter = match get_int(nodesys, node, "caustic_filter", 2) {
            0 => CausticFilter::None,
            1 => CausticFilter::Box,
            3 => CausticFilter::Gaussian,
            _ => CausticFilter::Cone,
        };
        o.caustic_filter_const = get_scalar(
            nodesys,
            node,
            "caustic_filter_const",
            o.caustic_filter_const,
        );
        o.photon_reflect_depth =
            get_int(nodesys, node, "photon_reflect_depth", o.photon_reflect_depth);
        o.photon_refract_depth =
            get_int(nodesys, node, "photon_refract_depth", o.photon_refract_depth);
        o.photon_decay = get_scalar(nodesys, node, "photon_decay", o.photon_decay);
        o.globillum = get_bool(nodesys, node, "globillum", o.globillum);
        o.globillum_photons = get_int(nodesys, node, "globillum_photons", o.globillum_photons);
        o.globillum_samples = get_int(nodesys, node, "globillum_samples", o.globillum_samples);
        o.globillum_radius = get_scalar(nodesys, node, "globillum_radius", o.globillum_radius);
        o.finalgather = get_bool(nodesys, node, "finalgather", o.finalgather);
        o.finalgather_rays =
            get_int(nodesys, node, "finalgather_rays", o.finalgather_rays as i32).max(1) as u32;
        o.finalgather_samples =
            get_int(nodesys, node, "finalgather_samples", o.finalgather_samples);
        o.finalgather_density =
            get_scalar(nodesys, node, "finalgather_density", o.finalgather_density);
        o.finalgather_radius =
            get_scalar(nodesys, node, "finalgather_radius", o.finalgather_radius);
        o.finalgather_falloff =
            get_bool(nodesys, node, "finalgather_falloff", o.finalgather_falloff);
        o.finalgather_falloff_start = get_scalar(
            nodesys,
            node,
            "finalgather_falloff_start",
            o.finalgather_falloff_start,
        );
        o.finalgather_falloff_stop = get_scalar(
            nodesys,
            node,
            "finalgather_falloff_stop",
            o.finalgather_falloff_stop,
        );
        o.finalgather_filter_size = get_scalar(
            nodesys,
            node,
            "finalgather_filter_size",
            o.finalgather_filter_size,
        );
        o
    }
}
