//! Property-style tests for the workflow template builder.
//!
//! Verifies that applying bindings overwrites exactly the bound paths
//! (and nothing else), that prototype-like path segments are always
//! refused, and that OS path encoding matches the backend family.

use comfyui_fleet::api::OsType;
use comfyui_fleet::template::{PromptTemplate, TemplateError};
use serde_json::{json, Value};

fn txt2img_workflow() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": 156680208700286u64,
                "steps": 20,
                "cfg": 8.0,
                "sampler_name": "euler",
                "scheduler": "normal",
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": "v1-5-pruned-emaonly.safetensors" }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": 512, "height": 512, "batch_size": 1 }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "masterpiece", "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "bad hands", "clip": ["4", 1] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] }
        }
    })
}

// ---------------------------------------------------------------------------
// Fidelity: exactly the bound paths change, nothing else
// ---------------------------------------------------------------------------

/// Binding a set of named paths and applying values must equal the
/// original workflow with exactly those paths overwritten.
#[test]
fn applied_values_touch_only_their_bound_paths() {
    let original = txt2img_workflow();
    let template = PromptTemplate::new(
        &original,
        ["prompt", "negative", "seed", "steps"],
        ["images"],
    )
    .set_input_node("prompt", "6.inputs.text")
    .unwrap()
    .set_input_node("negative", "7.inputs.text")
    .unwrap()
    .set_input_node("seed", "3.inputs.seed")
    .unwrap()
    .set_input_node("steps", "3.inputs.steps")
    .unwrap()
    .input("prompt", "a red fox")
    .unwrap()
    .input("negative", "blurry")
    .unwrap()
    .input("seed", 42)
    .unwrap()
    .input("steps", 30)
    .unwrap();

    // Build the expectation by hand from the original.
    let mut expected = original.clone();
    expected["6"]["inputs"]["text"] = json!("a red fox");
    expected["7"]["inputs"]["text"] = json!("blurry");
    expected["3"]["inputs"]["seed"] = json!(42);
    expected["3"]["inputs"]["steps"] = json!(30);

    assert_eq!(template.workflow(), &expected);
    // The caller's value never changed.
    assert_eq!(original, txt2img_workflow());
}

/// One name bound to several paths fans the value out to all of them.
#[test]
fn multi_path_binding_writes_everywhere() {
    let template = PromptTemplate::new(&txt2img_workflow(), ["resolution"], [] as [&str; 0])
        .set_input_paths("resolution", &["5.inputs.width", "5.inputs.height"])
        .unwrap()
        .input("resolution", 1024)
        .unwrap();

    assert_eq!(template.workflow()["5"]["inputs"]["width"], 1024);
    assert_eq!(template.workflow()["5"]["inputs"]["height"], 1024);
    // Untouched sibling survives.
    assert_eq!(template.workflow()["5"]["inputs"]["batch_size"], 1);
}

// ---------------------------------------------------------------------------
// Safety: prototype-like segments are refused everywhere
// ---------------------------------------------------------------------------

/// Every operation that accepts a path must refuse prototype-like
/// segments and leave the template byte-identical.
#[test]
fn prototype_segments_are_refused_and_leave_template_unchanged() {
    let template = PromptTemplate::new(&txt2img_workflow(), ["x"], [] as [&str; 0]);
    let before = template.workflow().clone();

    for path in [
        "__proto__.polluted",
        "3.__proto__.seed",
        "constructor.prototype.seed",
        "3.inputs.constructor",
        "prototype",
    ] {
        assert!(
            matches!(
                template.set_input_node("x", path),
                Err(TemplateError::InvalidPath(_))
            ),
            "set_input_node must refuse {path:?}"
        );
        assert!(
            matches!(
                template.append_input_node("x", path),
                Err(TemplateError::InvalidPath(_))
            ),
            "append_input_node must refuse {path:?}"
        );
    }

    assert_eq!(template.workflow(), &before);
    assert!(template.input_paths("x").unwrap().is_empty());
}

/// Writing through a name that was never declared is refused.
#[test]
fn unknown_names_fail_with_unknown_input() {
    let template = PromptTemplate::new(&txt2img_workflow(), ["seed"], [] as [&str; 0]);
    assert!(matches!(
        template.input("never-declared", 1),
        Err(TemplateError::UnknownInput(_))
    ));
}

// ---------------------------------------------------------------------------
// Path encoding
// ---------------------------------------------------------------------------

/// NT backends get backslashes, POSIX backends get forward slashes.
#[test]
fn checkpoint_path_encoding_follows_backend_os() {
    let template = PromptTemplate::new(&txt2img_workflow(), ["checkpoint"], [] as [&str; 0])
        .set_input_node("checkpoint", "4.inputs.ckpt_name")
        .unwrap();

    let nt = template
        .input_path("checkpoint", "models/sd/v1.safetensors", OsType::Nt)
        .unwrap();
    assert_eq!(
        nt.workflow()["4"]["inputs"]["ckpt_name"],
        "models\\sd\\v1.safetensors"
    );

    let posix = template
        .input_path("checkpoint", "models\\sd\\v1.safetensors", OsType::Posix)
        .unwrap();
    assert_eq!(
        posix.workflow()["4"]["inputs"]["ckpt_name"],
        "models/sd/v1.safetensors"
    );
}

// ---------------------------------------------------------------------------
// Bypass
// ---------------------------------------------------------------------------

/// Finalizing with a bypassed node prunes it and rewires its
/// consumers to the node it passed through.
#[test]
fn finalize_skips_bypassed_nodes() {
    let template = PromptTemplate::new(&txt2img_workflow(), [] as [&str; 0], ["images"])
        .set_output_node("images", "9")
        .unwrap()
        .bypass("7");

    let finalized = template.finalize();
    assert!(finalized.get("7").is_none());
    // Node 3 referenced 7 for its negative conditioning; the
    // reference now points at 7's own upstream (the checkpoint clip).
    assert_eq!(finalized["3"]["inputs"]["negative"], json!(["4", 1]));

    // The template itself is untouched and can be reinstated.
    let restored = template.reinstate("7");
    assert!(restored.finalize().get("7").is_some());
}
