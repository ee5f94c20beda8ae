//! Shader graph evaluation semantics: per-invocation memoization, the
//! sorted closure table and the explicit non-cached call path.

mod common;

use common::*;
use ember_render::camera::Camera;
use ember_render::math::{Vec3, Vec4};
use ember_render::nodesys::NodeObject;
use ember_render::obj::IFACE_NODESYS;
use ember_render::options::Options;
use ember_render::sampler::{BaseBucket, BucketType, PassParams};
use ember_render::shader::{self, param_table_of, ShaderInstParamTable};
use ember_render::state::{RayType, State};
use ember_render::tls::RayTls;
use ember_render::{NodeSystem, RenderContext, Value, ValueType};
use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static COUNTER_RUNS: AtomicUsize = AtomicUsize::new(0);

/// Counts every execution and returns a fixed color.
struct CountingShader;

impl NodeObject for CountingShader {
    fn main(&self, result: &mut Vec4, _state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        COUNTER_RUNS.fetch_add(1, Ordering::SeqCst);
        *result = Vec4::new(0.25, 0.5, 0.75, 1.0);
        true
    }
}

/// Evaluates both of its inputs and sums them.
struct ReaderShader;

impl NodeObject for ReaderShader {
    fn main(&self, result: &mut Vec4, state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        let ns = state
            .db()
            .interface::<NodeSystem>(IFACE_NODESYS)
            .unwrap();
        let a = shader::eval(&ns, state, 0);
        let b = shader::eval(&ns, state, 1);
        // evaluating the same parameter twice yields the cached value
        let a2 = shader::eval(&ns, state, 0);
        assert_eq!(a, a2);
        let (a, b) = match (a, b) {
            (Value::Vec3(a), Value::Vec3(b)) => (a, b),
            other => panic!("unexpected eval results: {:?}", other),
        };
        *result = Vec4::new(a[0] + b[0], a[1] + b[1], a[2] + b[2], 1.0);
        true
    }
}

/// Forces two non-cached executions of its input.
struct CallerShader;

impl NodeObject for CallerShader {
    fn main(&self, result: &mut Vec4, state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        let ns = state
            .db()
            .interface::<NodeSystem>(IFACE_NODESYS)
            .unwrap();
        let _ = shader::call(&ns, state, 0);
        let _ = shader::call(&ns, state, 0);
        *result = Vec4::zeros();
        true
    }
}

fn bare_bucket(ctx: &RenderContext) -> Arc<BaseBucket> {
    Arc::new(BaseBucket {
        db: ctx.db.clone(),
        opt: Arc::new(Options::default()),
        cam: Arc::new(Camera::default()),
        bucket_type: BucketType::Frame,
        pass: PassParams::default(),
        channels: Vec::new(),
        num_user_channels: 0,
        lights: Arc::new(Vec::new()),
        framebuffers: Arc::new(Vec::new()),
    })
}

fn declare_graph_shaders(ctx: &RenderContext) {
    ctx.declare_shader("counter", &[], Box::new(|| Box::new(CountingShader)));
    ctx.declare_shader(
        "reader",
        &[
            ("a", ValueType::Vec3, Value::Vec3([0.0; 3])),
            ("b", ValueType::Vec3, Value::Vec3([0.0; 3])),
        ],
        Box::new(|| Box::new(ReaderShader)),
    );
    ctx.declare_shader(
        "caller",
        &[("input", ValueType::Vec3, Value::Vec3([0.0; 3]))],
        Box::new(|| Box::new(CallerShader)),
    );
}

#[test]
fn linked_source_runs_once_per_graph_invocation() {
    let mut ctx = new_context(1);
    declare_graph_shaders(&ctx);

    let src = ctx.shader("counter", "src0").unwrap();
    ctx.end_shader(src);
    let root = ctx.shader("reader", "root0").unwrap();
    ctx.nodesys.link_parameter(root, "a", "src0", "");
    ctx.nodesys.link_parameter(root, "b", "src0", "");
    ctx.end_shader(root);

    let bucket = bare_bucket(&ctx);
    let tls = RefCell::new(RayTls::new());
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    let mut result = Vec4::zeros();

    COUNTER_RUNS.store(0, Ordering::SeqCst);
    let ok = shader::call_shader_instance(&ctx.nodesys, &mut result, &mut state, root, None);
    assert!(ok);
    assert_eq!(
        COUNTER_RUNS.load(Ordering::SeqCst),
        1,
        "memoized source executed more than once in one graph call"
    );
    // both parameters saw the source's standard result
    assert!((result.x - 0.5).abs() < 1.0e-6);
    assert!((result.y - 1.0).abs() < 1.0e-6);

    // a second root call is a fresh invocation
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    shader::call_shader_instance(&ctx.nodesys, &mut result, &mut state, root, None);
    assert_eq!(COUNTER_RUNS.load(Ordering::SeqCst), 2);
}

#[test]
fn param_table_closure_is_sorted_and_complete() {
    let mut ctx = new_context(1);
    declare_graph_shaders(&ctx);

    let src = ctx.shader("counter", "s1").unwrap();
    ctx.end_shader(src);
    let mid = ctx.shader("reader", "m1").unwrap();
    ctx.nodesys.link_parameter(mid, "a", "s1", "");
    ctx.end_shader(mid);
    let root = ctx.shader("reader", "r1").unwrap();
    ctx.nodesys.link_parameter(root, "a", "m1", "");
    ctx.nodesys.link_parameter(root, "b", "s1", "");
    ctx.end_shader(root);

    let bucket = bare_bucket(&ctx);
    let tls = RefCell::new(RayTls::new());
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    let mut result = Vec4::zeros();
    shader::call_shader_instance(&ctx.nodesys, &mut result, &mut state, root, None);

    let table_tag = param_table_of(&ctx.db, root);
    let table = ctx.db.read::<ShaderInstParamTable>(table_tag);
    assert!(table.generated);
    assert_eq!(table.nodes.len(), 3, "closure misses reachable instances");
    for w in table.nodes.windows(2) {
        assert!(
            w[0].tag.raw() < w[1].tag.raw(),
            "sorted node table not strictly ascending"
        );
    }
    assert!(table.shader_cache_size() > 0);
}

#[test]
fn call_bypasses_the_shader_cache() {
    let mut ctx = new_context(1);
    declare_graph_shaders(&ctx);

    let src = ctx.shader("counter", "nc_src").unwrap();
    ctx.end_shader(src);
    let root = ctx.shader("caller", "nc_root").unwrap();
    ctx.nodesys.link_parameter(root, "input", "nc_src", "");
    ctx.end_shader(root);

    let bucket = bare_bucket(&ctx);
    let tls = RefCell::new(RayTls::new());
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    let mut result = Vec4::zeros();

    COUNTER_RUNS.store(0, Ordering::SeqCst);
    shader::call_shader_instance(&ctx.nodesys, &mut result, &mut state, root, None);
    assert_eq!(
        COUNTER_RUNS.load(Ordering::SeqCst),
        2,
        "explicit call must re-execute the source"
    );
}

#[test]
fn editing_a_graph_invalidates_its_param_table() {
    let mut ctx = new_context(1);
    declare_graph_shaders(&ctx);

    let root = ctx.shader("reader", "inv_root").unwrap();
    ctx.end_shader(root);

    let bucket = bare_bucket(&ctx);
    let tls = RefCell::new(RayTls::new());
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    let mut result = Vec4::zeros();
    shader::call_shader_instance(&ctx.nodesys, &mut result, &mut state, root, None);
    let table_tag = param_table_of(&ctx.db, root);
    assert_eq!(ctx.db.read::<ShaderInstParamTable>(table_tag).nodes.len(), 1);

    // linking a new source grows the closure after regeneration
    let src = ctx.shader("counter", "inv_src").unwrap();
    ctx.end_shader(src);
    let root_again = ctx.shader("reader", "inv_root").unwrap();
    ctx.nodesys.link_parameter(root_again, "a", "inv_src", "");
    ctx.end_shader(root_again);

    let mut state = State::new(RayType::Eye, &bucket, &tls);
    shader::call_shader_instance(&ctx.nodesys, &mut result, &mut state, root, None);
    assert_eq!(ctx.db.read::<ShaderInstParamTable>(table_tag).nodes.len(), 2);
}
