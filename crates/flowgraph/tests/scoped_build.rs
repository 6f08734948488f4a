use std::io;
use std::sync::{Arc, Mutex};

use flowgraph::ir::scoped::{BindingBlock, Callee, FuncAttrs, Module, ScopedBuilder};
use flowgraph::ir::{
    AttrRecord, AttrValue, DType, Dimension, PrimValue, Shape, Span, StructInfo, TensorData,
};
use flowgraph::{build_scoped, BuildConfig, BuildError, Graph};

fn f32_tensor(dims: &[usize]) -> StructInfo {
    StructInfo::tensor(DType::F32, dims)
}

fn zeros(dims: &[usize]) -> TensorData {
    let count = dims.iter().product::<usize>();
    TensorData::from_f32(dims, &vec![0.0; count])
}

fn names(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}

fn kept_names(graph: &Graph) -> Vec<&str> {
    graph.nodes().map(|node| node.name.as_str()).collect()
}

/// `main(a, b) { node1 = conv2d(a, w) }` with a constant `w` and an unused `b`.
fn conv_module() -> Module {
    let mut b = ScopedBuilder::new();
    let a = b.var("a", f32_tensor(&[1, 3, 8, 8]));
    let unused = b.var("b", f32_tensor(&[1, 3, 8, 8]));
    let w = b.constant("w", zeros(&[4, 3, 3, 3]));
    let attrs = AttrRecord::new()
        .with("strides", AttrValue::IntList(vec![1, 1]))
        .with("data_layout", AttrValue::Str("NCHW".into()));
    let conv = b.call_op(
        "relax.nn.conv2d",
        vec![a, w],
        Some(attrs),
        f32_tensor(&[1, 4, 6, 6]),
    );
    b.set_name(conv, "node1");
    let node1 = b.bind("lv0", conv);
    let main = b.function(
        vec![a, unused],
        vec![BindingBlock::new("block", vec![node1])],
        node1.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    b.finish()
}

#[test]
fn conv_weight_is_split_from_activations() {
    let module = conv_module();
    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");

    assert_eq!(graph.name(), "main");
    assert_eq!(names(graph.input_names()), vec!["a:0", "b:0"]);
    assert_eq!(names(graph.output_names()), vec!["node1:0"]);
    assert_eq!(kept_names(&graph), vec!["a", "b", "node1"]);

    let node = graph.find_node("node1").expect("node1");
    assert_eq!(node.op_type, "nn.conv2d");
    assert_eq!(node.scope, vec!["block".to_string()]);
    assert_eq!(node.attr("strides"), Some("1,1"));
    assert_eq!(node.attr("data_layout"), Some("NCHW"));
    let inputs: Vec<&str> = node
        .inputs
        .iter()
        .map(|input| graph.resolve(*input).expect("input tensor").name.as_str())
        .collect();
    assert_eq!(inputs, vec!["a:0"]);
    assert_eq!(node.weights.keys().collect::<Vec<_>>(), vec!["weight"]);

    let weight = node.weight("weight").expect("weight slot");
    assert_eq!(weight.name, "w");
    assert_eq!(weight.shape, Shape::from_static(&[4, 3, 3, 3]));
    assert_eq!(graph.weights().keys().collect::<Vec<_>>(), vec!["w"]);

    let output = graph.find_tensor("node1:0").expect("output");
    assert_eq!(output.shape, Shape::from_static(&[1, 4, 6, 6]));
    assert_eq!(output.alias(), "node1");
    let aliases: Vec<String> = graph
        .input_tensors()
        .expect("inputs")
        .iter()
        .map(|tensor| tensor.alias().to_string())
        .collect();
    assert_eq!(aliases, vec!["a", "b"]);
}

#[test]
fn pruning_drops_unconsumed_inputs() {
    let module = conv_module();
    let config = BuildConfig {
        prune_unused_inputs: true,
        ..BuildConfig::default()
    };
    let graph = build_scoped(&module, "main", &config).expect("build graph");

    assert_eq!(names(graph.input_names()), vec!["a:0"]);
    assert_eq!(kept_names(&graph), vec!["a", "node1"]);
    assert!(graph.find_node("b").is_err());
    let node = graph.find_node("node1").expect("node1");
    assert_eq!(node.index, Some(1));
    assert_eq!(node.weight("weight").expect("weight").name, "w");
}

#[test]
fn weight_producers_stay_resolvable() {
    let module = conv_module();
    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");

    let producer = graph.find_producer("w:0").expect("weight producer");
    assert_eq!(producer.op_type, "constant");
    assert_eq!(producer.index, None);
    assert!(graph.find_node("w").is_err());

    let weight = graph.find_tensor("w").expect("weight tensor");
    assert_eq!(weight.dtype, DType::F32);

    let consumers: Vec<&str> = graph
        .consumers("a:0")
        .iter()
        .map(|node| node.name.as_str())
        .collect();
    assert_eq!(consumers, vec!["node1"]);

    match graph.find_tensor("missing:0").expect_err("unknown tensor") {
        BuildError::UnknownTensor { name } => assert_eq!(name, "missing:0"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn builds_are_deterministic_and_densely_indexed() {
    let module = conv_module();
    let summarize = |graph: &Graph| {
        graph
            .nodes()
            .map(|node| {
                let outputs = node
                    .outputs
                    .iter()
                    .map(|tensor| (tensor.name.clone(), tensor.dtype, tensor.shape.clone()))
                    .collect::<Vec<_>>();
                (node.index, node.name.clone(), node.op_type.clone(), outputs)
            })
            .collect::<Vec<_>>()
    };

    let first = build_scoped(&module, "main", &BuildConfig::default()).expect("first build");
    let second = build_scoped(&module, "main", &BuildConfig::default()).expect("second build");
    assert_eq!(summarize(&first), summarize(&second));

    let indices: Vec<Option<usize>> = first.nodes().map(|node| node.index).collect();
    let expected: Vec<Option<usize>> = (0..first.node_count()).map(Some).collect();
    assert_eq!(indices, expected);

    for node in first.nodes() {
        for output in &node.outputs {
            assert!(
                first.find_weight(&output.name).is_none(),
                "{} is both an activation and a weight",
                output.name
            );
        }
    }
}

#[test]
fn explicit_aliases_apply_only_on_exact_count() {
    let module = conv_module();
    let config = BuildConfig::default()
        .with_input_aliases(["image", "extra"])
        .with_output_aliases(["logits"]);
    let graph = build_scoped(&module, "main", &config).expect("build graph");
    let inputs = graph.input_tensors().expect("inputs");
    assert_eq!(inputs[0].alias(), "image");
    assert_eq!(inputs[1].alias(), "extra");
    assert_eq!(graph.output_tensors().expect("outputs")[0].alias(), "logits");

    let config = BuildConfig::default()
        .with_input_aliases(["image"])
        .with_output_aliases(["logits", "extra"]);
    let graph = build_scoped(&module, "main", &config).expect("build graph");
    let inputs = graph.input_tensors().expect("inputs");
    assert_eq!(inputs[0].alias(), "a");
    assert_eq!(inputs[1].alias(), "b");
    assert_eq!(graph.output_tensors().expect("outputs")[0].alias(), "node1");
}

#[test]
fn shared_constant_resolves_to_one_weight() {
    let mut b = ScopedBuilder::new();
    let x = b.var("x", f32_tensor(&[1, 4, 8, 8]));
    let w = b.constant("shared.w", zeros(&[4, 4, 1, 1]));
    let first = b.call_op("relax.nn.conv2d", vec![x, w], None, f32_tensor(&[1, 4, 8, 8]));
    let first = b.bind("conv_a", first);
    let second = b.call_op(
        "relax.nn.conv2d",
        vec![first.var, w],
        None,
        f32_tensor(&[1, 4, 8, 8]),
    );
    let second = b.bind("conv_b", second);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("block", vec![first, second])],
        second.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");
    let a = graph.find_node("conv_a").expect("conv_a");
    let c = graph.find_node("conv_b").expect("conv_b");
    let shared = graph.find_weight("shared.w").expect("shared weight");
    assert!(Arc::ptr_eq(a.weight("weight").expect("a weight"), shared));
    assert!(Arc::ptr_eq(c.weight("weight").expect("b weight"), shared));
    assert_eq!(graph.weights().len(), 1);
    assert_eq!(kept_names(&graph), vec!["x", "conv_a", "conv_b"]);
}

#[test]
fn projection_of_fresh_tuple_reads_the_packed_field() {
    let mut b = ScopedBuilder::new();
    let a = b.var("a", f32_tensor(&[2]));
    let c = b.var("c", f32_tensor(&[3]));
    let tuple = b.tuple(vec![a, c]);
    let packed = b.bind("packed", tuple);
    let item = b.get_item(packed.var, 1);
    let picked = b.bind("picked", item);
    let main = b.function(
        vec![a, c],
        vec![BindingBlock::new("block", vec![packed, picked])],
        picked.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");
    let packed = graph.find_node("packed").expect("tuple node");
    assert_eq!(packed.op_type, "tuple");
    assert_eq!(packed.outputs.len(), 2);

    let picked = graph.find_node("picked").expect("get_item node");
    assert_eq!(picked.op_type, "get_item");
    assert_eq!(picked.attr("index"), Some("1"));
    assert_eq!(picked.inputs.len(), 1);
    let source = graph.find_node("c").expect("c");
    assert_eq!(picked.inputs[0].node, source.id);
    assert_eq!(picked.inputs[0].slot, 0);
    assert_eq!(
        graph.find_tensor("picked:0").expect("picked").shape,
        Shape::from_static(&[3])
    );
}

#[test]
fn shape_arguments_fold_into_attributes() {
    let mut b = ScopedBuilder::new();
    let x = b.var("x", f32_tensor(&[1, 3, 4]));
    let shape = b.shape_expr(vec![Dimension::Static(1), Dimension::Static(12)]);
    let reshape = b.call_op("relax.reshape", vec![x, shape], None, f32_tensor(&[1, 12]));
    let reshaped = b.bind("flat", reshape);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("stage1.head", vec![reshaped])],
        reshaped.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");
    assert_eq!(kept_names(&graph), vec!["x", "flat"]);
    let node = graph.find_node("flat").expect("reshape");
    assert_eq!(node.op_type, "reshape");
    assert_eq!(node.attr("shape"), Some("1,12"));
    assert_eq!(node.inputs.len(), 1);
    assert_eq!(node.scope, vec!["stage1".to_string(), "head".to_string()]);
    assert!(node.weights.is_empty());
}

#[test]
fn bound_shape_literals_become_shape_nodes() {
    let mut b = ScopedBuilder::new();
    let shape = b.shape_expr(vec![Dimension::symbol("n"), Dimension::Static(4)]);
    let bound = b.bind("target_shape", shape);
    let main = b.function(
        Vec::new(),
        vec![BindingBlock::new("block", vec![bound])],
        bound.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");
    let node = graph.find_node("target_shape").expect("shape node");
    assert_eq!(node.op_type, "shape");
    assert_eq!(node.attr("shape"), Some("n,4"));
    let output = graph.find_tensor("target_shape:0").expect("shape output");
    assert_eq!(output.dtype, DType::Si32);
    assert_eq!(output.shape, Shape::from_static(&[2]));
    assert!(graph.input_names().is_empty());
}

/// Adds `name` as a module-level composite `msc.linear*` function over `params`.
fn add_linear_composite(b: &mut ScopedBuilder, name: &str, composite: &str, params: usize) {
    let mut vars = vec![
        b.var("p_x", f32_tensor(&[2, 8])),
        b.var("p_w", f32_tensor(&[8, 16])),
    ];
    if params == 3 {
        vars.push(b.var("p_b", f32_tensor(&[1, 16])));
    }
    let attrs = AttrRecord::new().with("out_dtype", AttrValue::DType(DType::F32));
    let matmul = b.call_op("relax.matmul", vars[..2].to_vec(), Some(attrs), f32_tensor(&[2, 16]));
    let matmul = b.bind("mm", matmul);
    let function = b.function(
        vars,
        vec![BindingBlock::new(name, vec![matmul])],
        matmul.var,
        FuncAttrs::composite(composite),
    );
    b.add_function(name, function);
}

#[test]
fn linear_weights_are_normalized() {
    let mut b = ScopedBuilder::new();
    add_linear_composite(&mut b, "fused_linear_bias", "msc.linear_bias", 3);
    let x = b.var("x", f32_tensor(&[2, 8]));
    let w = b.constant_with_span(Span::named("fc.weight").with_layout("IO"), zeros(&[8, 16]));
    let bias = b.constant("fc.bias", zeros(&[1, 16]));
    let call = b.call(
        Callee::Global("fused_linear_bias".into()),
        vec![x, w, bias],
        None,
        f32_tensor(&[2, 16]),
    );
    let fc = b.bind("fc", call);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("block", vec![fc])],
        fc.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");
    let node = graph.find_node("fc").expect("fc");
    assert_eq!(node.op_type, "msc.linear_bias");
    assert_eq!(node.attr("out_dtype"), Some("float32"));

    let weight = node.weight("weight").expect("weight");
    assert_eq!(weight.name, "fc.weight");
    assert_eq!(weight.layout, "OI");
    assert_eq!(weight.shape, Shape::from_static(&[16, 8]));

    let bias = node.weight("bias").expect("bias");
    assert_eq!(bias.layout, "O");
    assert_eq!(bias.shape, Shape::from_static(&[16]));
    assert_eq!(kept_names(&graph), vec!["x", "fc"]);
}

/// `main(x) { fused_clip = fn(p) { clip(p, 0, 6) }; act = fused_clip(x) }`
fn local_clip_module() -> Module {
    let mut b = ScopedBuilder::new();
    let p = b.var("p", f32_tensor(&[1, 8]));
    let low = b.prim(PrimValue::Int(0));
    let high = b.prim(PrimValue::Int(6));
    let clip = b.call_op("relax.clip", vec![p, low, high], None, f32_tensor(&[1, 8]));
    let clipped = b.bind("clipped", clip);
    let function = b.function(
        vec![p],
        vec![BindingBlock::new("inner", vec![clipped])],
        clipped.var,
        FuncAttrs::composite("tensorrt.clip"),
    );
    let fused = b.bind("fused_clip", function);

    let x = b.var("x", f32_tensor(&[1, 8]));
    let call = b.call(Callee::Local(fused.var), vec![x], None, f32_tensor(&[1, 8]));
    let act = b.bind("act", call);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("main_block", vec![fused, act])],
        act.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    b.finish()
}

#[test]
fn local_composite_takes_trailing_scalars() {
    let module = local_clip_module();
    let config = BuildConfig::default().with_target("tensorrt");
    let graph = build_scoped(&module, "main", &config).expect("build graph");

    assert_eq!(kept_names(&graph), vec!["x", "act"]);
    let node = graph.find_node("act").expect("act");
    assert_eq!(node.op_type, "clip");
    assert_eq!(node.attr("min"), Some("0"));
    assert_eq!(node.attr("max"), Some("6"));
    assert_eq!(node.scope, vec!["main_block".to_string()]);
}

#[test]
fn local_composite_requires_matching_target() {
    let module = local_clip_module();
    let err = build_scoped(&module, "main", &BuildConfig::default()).expect_err("no target");
    match err {
        BuildError::TargetMismatch { composite, target } => {
            assert_eq!(composite, "tensorrt.clip");
            assert_eq!(target, "");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn scalar_routed_to_input_role_is_rejected() {
    let mut b = ScopedBuilder::new();
    let x = b.var("x", f32_tensor(&[4]));
    let one = b.prim(PrimValue::Float(1.0));
    let add = b.call_op("relax.add", vec![x, one], None, f32_tensor(&[4]));
    let added = b.bind("added", add);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("block", vec![added])],
        added.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let err = build_scoped(&module, "main", &BuildConfig::default()).expect_err("prim input");
    match err {
        BuildError::PrimValueAsInput { op_type, index } => {
            assert_eq!(op_type, "add");
            assert_eq!(index, 1);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn var_names_win_when_requested() {
    let module = conv_module();
    let config = BuildConfig {
        use_var_name: true,
        ..BuildConfig::default()
    };
    let graph = build_scoped(&module, "main", &config).expect("build graph");
    assert!(graph.find_node("node1").is_err());
    let node = graph.find_node("lv0").expect("lv0");
    assert_eq!(names(graph.output_names()), vec!["lv0:0"]);
    assert_eq!(node.outputs[0].alias(), "lv0");
}

#[test]
fn var_to_var_bindings_share_tensors() {
    let mut b = ScopedBuilder::new();
    let x = b.var("x", f32_tensor(&[4]));
    let relu = b.call_op("relax.nn.relu", vec![x], None, f32_tensor(&[4]));
    let act = b.bind("act", relu);
    let renamed = b.bind("out", act.var);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("block", vec![act, renamed])],
        renamed.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let graph = build_scoped(&module, "main", &BuildConfig::default()).expect("build graph");
    assert_eq!(names(graph.output_names()), vec!["act:0"]);
    assert_eq!(graph.node_count(), 2);
}

#[test]
fn missing_entry_is_reported() {
    let module = conv_module();
    let err = build_scoped(&module, "forward", &BuildConfig::default()).expect_err("missing");
    match err {
        BuildError::MissingFunction { name } => assert_eq!(name, "forward"),
        other => panic!("unexpected error {other:?}"),
    }
}

/// Shared sink for formatted log lines.
#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("log buffer")).into_owned()
    }
}

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn failed_binding_logs_the_expression_kind() {
    let mut b = ScopedBuilder::new();
    let x = b.var("x", f32_tensor(&[4]));
    let one = b.prim(PrimValue::Int(1));
    let add = b.call_op("relax.add", vec![x, one], None, f32_tensor(&[4]));
    let added = b.bind("added", add);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("block", vec![added])],
        added.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let log = CapturedLog::default();
    let writer = log.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, || {
        build_scoped(&module, "main", &BuildConfig::default())
    });

    assert!(result.is_err());
    let text = log.contents();
    assert!(text.contains("failed to add node"), "{text}");
    assert!(text.contains("kind="), "{text}");
    assert!(text.contains("Call"), "{text}");
    assert!(text.contains("added"), "{text}");
}

#[test]
fn tuple_layout_must_cover_every_field() {
    let mut b = ScopedBuilder::new();
    let a = b.var("a", f32_tensor(&[1, 3]));
    let c = b.var("c", f32_tensor(&[1, 3]));
    let tuple = b.tuple(vec![a, c]);
    b.set_span(tuple, Span::new().with_layout("NC"));
    let packed = b.bind("packed", tuple);
    let main = b.function(
        vec![a, c],
        vec![BindingBlock::new("block", vec![packed])],
        packed.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let err = build_scoped(&module, "main", &BuildConfig::default()).expect_err("layout");
    match err {
        BuildError::LayoutMismatch { layout, fields } => {
            assert_eq!(layout, "NC");
            assert_eq!(fields, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unresolvable_local_callee_stops_param_propagation() {
    let mut b = ScopedBuilder::new();
    let p = b.var("p", f32_tensor(&[4]));
    let part = b.function(vec![p], Vec::new(), p, FuncAttrs::codegen("tensorrt"));
    b.add_function("part", part);

    let x = b.var("x", f32_tensor(&[4]));
    let f = b.var(
        "f",
        StructInfo::Func {
            ret: Box::new(f32_tensor(&[4])),
        },
    );
    let call = b.call(Callee::Local(f), vec![x], None, f32_tensor(&[4]));
    let out = b.bind("out", call);
    let main = b.function(
        vec![x, f],
        vec![BindingBlock::new("block", vec![out])],
        out.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let config = BuildConfig::default().with_byoc_entry("part");
    let err = build_scoped(&module, "main", &config).expect_err("unresolved callee");
    match err {
        BuildError::UnresolvedCallee { callee } => assert_eq!(callee, f),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn argument_never_lowered_is_reported() {
    let mut b = ScopedBuilder::new();
    let x = b.var("x", f32_tensor(&[4]));
    let ghost = b.var("ghost", f32_tensor(&[4]));
    let relu = b.call_op("relax.nn.relu", vec![ghost], None, f32_tensor(&[4]));
    let act = b.bind("act", relu);
    let main = b.function(
        vec![x],
        vec![BindingBlock::new("block", vec![act])],
        act.var,
        FuncAttrs::default(),
    );
    b.add_function("main", main);
    let module = b.finish();

    let err = build_scoped(&module, "main", &BuildConfig::default()).expect_err("free variable");
    match err {
        BuildError::NotLowered { what, expr } => {
            assert_eq!(what, "call argument");
            assert_eq!(expr, ghost);
        }
        other => panic!("unexpected error {other:?}"),
    }
}
