use solidtree_scene::{SceneDrawable, SceneSnapshot};

use crate::model::Model;
use crate::node::{Node, NodeId};

/// Collects one drawable per visible outermost geometry node. Geometry
/// children are already composed into their parent and are not drawn on
/// their own.
pub fn scene_snapshot(model: &Model, base_color: [f32; 3]) -> SceneSnapshot {
    let mut snapshot = SceneSnapshot::new(base_color);
    for root in model.roots() {
        collect(model, *root, false, &mut snapshot);
    }
    snapshot
}

fn collect(model: &Model, id: NodeId, parent_is_geometry: bool, snapshot: &mut SceneSnapshot) {
    let Ok(node) = model.node(id) else {
        return;
    };
    if !node.visible() {
        return;
    }
    if node.is_geometry() && !parent_is_geometry {
        if let Some(drawable) = drawable(node) {
            snapshot.drawables.push(drawable);
        }
    }
    for child in node.children() {
        collect(model, *child, node.is_geometry(), snapshot);
    }
}

fn drawable(node: &Node) -> Option<SceneDrawable> {
    let transform = node.transform();
    let previewing = transform.use_temp_mat && transform.temp.is_some();
    let mesh = match (previewing, node.preview()) {
        (true, Some(preview)) => preview.clone(),
        _ => node.mesh()?.clone(),
    };
    Some(SceneDrawable {
        node: node.id().raw(),
        mesh,
        matrix: transform.render_matrix(),
        opacity: node.opacity(),
        preview: previewing,
    })
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::component::{ComponentKind, ComponentValue};
    use crate::node::NodeKind;
    use crate::rebuild::RebuildEngine;
    use crate::watchers::test_support::{add, id};

    fn built_model() -> Model {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Group, None);
        add(&mut model, 2, NodeKind::Cuboid, Some(1));
        add(&mut model, 3, NodeKind::Null, None);
        add(&mut model, 4, NodeKind::Ellipsoid, Some(3));
        add(&mut model, 5, NodeKind::Torus, None);
        model
            .set_value(id(5), ComponentKind::Visible, ComponentValue::Bool(false))
            .expect("hide");
        RebuildEngine::default()
            .run_frame(&mut model)
            .expect("frame");
        model
    }

    #[test]
    fn only_outermost_visible_geometry_is_drawn() {
        let model = built_model();
        let snapshot = scene_snapshot(&model, [0.1, 0.1, 0.1]);
        let nodes: Vec<u64> = snapshot.drawables.iter().map(|d| d.node).collect();
        assert_eq!(nodes, vec![1, 4]);
        assert_eq!(snapshot.base_color, [0.1, 0.1, 0.1]);
    }

    #[test]
    fn drag_preview_uses_temp_matrix_and_box_mesh() {
        let mut model = built_model();
        let temp = Mat4::from_translation(Vec3::new(0.0, 3.0, 0.0));
        model.set_temp_matrix(id(1), Some(temp)).expect("temp");
        model.set_use_temp_mat(id(1), true).expect("use temp");

        let snapshot = scene_snapshot(&model, [0.0; 3]);
        let drawable = snapshot.drawable(1).expect("drawable");
        assert!(drawable.preview);
        assert_eq!(drawable.matrix, temp);
        assert_eq!(drawable.mesh.triangle_count(), 12);

        model.set_use_temp_mat(id(1), false).expect("use world");
        let snapshot = scene_snapshot(&model, [0.0; 3]);
        let drawable = snapshot.drawable(1).expect("drawable");
        assert!(!drawable.preview);
        assert_eq!(drawable.matrix, Mat4::IDENTITY);
    }
}
