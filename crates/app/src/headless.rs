use std::path::{Path, PathBuf};
use std::process;

use serde_json::json;
use solidtree_core::{
    scene_snapshot, Model, NodeDescription, NodeId, NodeKind, RebuildEngine, RebuildReport,
    SceneDocument,
};
use solidtree_scene::SceneSnapshot;

const BASE_COLOR: [f32; 3] = [0.18, 0.18, 0.2];

struct HeadlessArgs {
    scene_path: Option<PathBuf>,
    save_path: Option<PathBuf>,
    frames: u32,
    print: bool,
}

impl Default for HeadlessArgs {
    fn default() -> Self {
        Self {
            scene_path: None,
            save_path: None,
            frames: 1,
            print: false,
        }
    }
}

/// Totals gathered over every frame of a run.
#[derive(Debug, Default)]
struct RunSummary {
    frames: u32,
    passes: u32,
    rebuilt: usize,
    mirrored: usize,
    deferred: usize,
    failed: usize,
}

impl RunSummary {
    fn add(&mut self, report: &RebuildReport) {
        self.frames += 1;
        self.passes += report.passes;
        self.rebuilt += report.rebuilt.len() + report.partial.len();
        self.mirrored += report.mirrored.len();
        self.deferred += report.deferred.len();
        self.failed += report.failed.len();
    }
}

pub fn run(args: &[String]) -> Result<(), String> {
    let parsed = parse_headless_args(args)?;
    let document = if let Some(path) = &parsed.scene_path {
        let document = load_scene(path)?;
        tracing::info!("headless: loaded {:?} ({} roots)", path, document.nodes.len());
        document
    } else {
        tracing::info!("headless: no --scene given, using the built-in scene");
        default_scene()
    };

    let (model, summary) = rebuild_document(&document, parsed.frames)?;
    let snapshot = scene_snapshot(&model, BASE_COLOR);
    tracing::info!(
        "headless: {} frames, {} passes, {} rebuilt, {} mirrored, {} deferred, {} failed",
        summary.frames,
        summary.passes,
        summary.rebuilt,
        summary.mirrored,
        summary.deferred,
        summary.failed
    );

    let rebuilt = SceneDocument::from_model(&model, document.settings.clone())
        .map_err(|err| err.to_string())?;
    if let Some(path) = &parsed.save_path {
        save_scene(&rebuilt, path)?;
        tracing::info!("headless: saved scene to {:?}", path);
    }

    if parsed.print {
        println!("{}", rebuilt.to_json().map_err(|err| err.to_string())?);
    } else {
        let text = serde_json::to_string_pretty(&summary_json(&model, &snapshot, &summary))
            .map_err(|err| err.to_string())?;
        println!("{text}");
    }

    tracing::info!("headless: completed");
    Ok(())
}

fn rebuild_document(
    document: &SceneDocument,
    frames: u32,
) -> Result<(Model, RunSummary), String> {
    let mut model = Model::new();
    document
        .load_into(&mut model)
        .map_err(|err| err.to_string())?;

    let mut engine = RebuildEngine::new(document.settings.clone());
    let mut summary = RunSummary::default();
    for frame in 0..frames.max(1) {
        let report = engine
            .run_frame(&mut model)
            .map_err(|err| err.to_string())?;
        for (node, reason) in &report.failed {
            tracing::warn!("headless: node {node} resolved to null geometry: {reason}");
        }
        tracing::debug!(
            "headless: frame {frame} took {:.2} ms over {} passes",
            report.duration_ms,
            report.passes
        );
        summary.add(&report);
        if !model.is_dirty() {
            break;
        }
    }
    Ok((model, summary))
}

fn summary_json(model: &Model, snapshot: &SceneSnapshot, summary: &RunSummary) -> serde_json::Value {
    let drawables: Vec<_> = snapshot
        .drawables
        .iter()
        .map(|drawable| {
            let name = model
                .node(NodeId::new(drawable.node))
                .map(|node| node.name().to_string())
                .unwrap_or_default();
            json!({
                "node": drawable.node,
                "name": name,
                "triangles": drawable.mesh.triangle_count(),
                "bounds": drawable.mesh.bounds(),
            })
        })
        .collect();
    json!({
        "nodes": model.len(),
        "frames": summary.frames,
        "passes": summary.passes,
        "rebuilt": summary.rebuilt,
        "mirrored": summary.mirrored,
        "deferred": summary.deferred,
        "failed": summary.failed,
        "triangles": snapshot.triangle_count(),
        "drawables": drawables,
    })
}

fn parse_headless_args(args: &[String]) -> Result<HeadlessArgs, String> {
    let mut parsed = HeadlessArgs::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--scene" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--scene requires a path".to_string())?;
                parsed.scene_path = Some(PathBuf::from(value));
            }
            "--save" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--save requires a path".to_string())?;
                parsed.save_path = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--frames requires a count".to_string())?;
                parsed.frames = value
                    .parse()
                    .map_err(|_| format!("invalid frame count {value}"))?;
            }
            "--log" => {
                iter.next();
            }
            "--print" => {
                parsed.print = true;
            }
            "--help" | "-h" => {
                print_headless_help();
                process::exit(0);
            }
            other => {
                tracing::warn!("headless: ignoring unknown argument {other}");
            }
        }
    }

    Ok(parsed)
}

fn print_headless_help() {
    println!(
        "Options:\n  --scene <path>\n  --save <path>\n  --frames <count>\n  --print\n  --log <off|error|warn|info|debug|trace>"
    );
}

fn load_scene(path: &Path) -> Result<SceneDocument, String> {
    let text = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    SceneDocument::from_json(&text).map_err(|err| err.to_string())
}

fn save_scene(document: &SceneDocument, path: &Path) -> Result<(), String> {
    let text = document.to_json().map_err(|err| err.to_string())?;
    std::fs::write(path, text).map_err(|err| err.to_string())
}

/// A block with a spherical bite taken out, plus its mirror image.
fn default_scene() -> SceneDocument {
    let mut block = NodeDescription::new(NodeKind::Cuboid);
    block.id = Some(NodeId::new(2));
    block.data.insert("size".to_string(), json!([1.0, 1.0, 1.0]));

    let mut bite = NodeDescription::new(NodeKind::Ellipsoid);
    bite.id = Some(NodeId::new(3));
    bite.data.insert("radii".to_string(), json!([0.6, 0.6, 0.6]));
    bite.data.insert("position".to_string(), json!([0.5, 0.5, 0.5]));
    bite.data.insert("subtract".to_string(), json!(true));

    let mut group = NodeDescription::new(NodeKind::Group);
    group.id = Some(NodeId::new(1));
    group.data.insert("name".to_string(), json!("bitten block"));
    group.data.insert("position".to_string(), json!([1.5, 0.0, 0.0]));
    group.children = vec![block, bite];

    let mut mirror = NodeDescription::new(NodeKind::Group);
    mirror.id = Some(NodeId::new(4));
    mirror.instance_id = Some(NodeId::new(1));
    mirror.data.insert("name".to_string(), json!("bitten block mirror"));

    SceneDocument {
        nodes: vec![group, mirror],
        ..SceneDocument::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        let parsed = parse_headless_args(&args(&[
            "solidtree", "--scene", "a.json", "--frames", "3", "--log", "debug", "--print",
        ]))
        .expect("parse");
        assert_eq!(parsed.scene_path, Some(PathBuf::from("a.json")));
        assert_eq!(parsed.frames, 3);
        assert!(parsed.print);
        assert!(parsed.save_path.is_none());

        assert!(parse_headless_args(&args(&["solidtree", "--frames", "many"])).is_err());
        assert!(parse_headless_args(&args(&["solidtree", "--scene"])).is_err());
    }

    #[test]
    fn built_in_scene_rebuilds() {
        let (model, summary) = rebuild_document(&default_scene(), 2).expect("rebuild");
        assert_eq!(model.len(), 4);
        assert!(summary.rebuilt > 0);
        assert_eq!(summary.failed, 0);
        assert!(model
            .node(NodeId::new(1))
            .expect("group")
            .mesh()
            .is_some_and(|mesh| !mesh.is_empty()));

        let snapshot = scene_snapshot(&model, BASE_COLOR);
        assert!(snapshot.drawable(1).is_some());
    }
}
