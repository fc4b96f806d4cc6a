//! Texture-streaming selection: nodes are chosen by the virtual texture mips
//! their footprint needs on screen instead of by visibility range.

use crate::quadtree::{
    ChildReport, NodeEvaluator, Outcome, TraversalFrame, Visit, classify, push_or_overflow,
};
use crate::selection::{LodSelection, MipInterval, SelectionDesc, TextureStreamingParams};

pub(crate) struct StreamingEvaluator<'a> {
    desc: &'a SelectionDesc,
    params: TextureStreamingParams,
}

impl<'a> StreamingEvaluator<'a> {
    pub(crate) fn new(desc: &'a SelectionDesc) -> Self {
        Self {
            desc,
            params: desc.streaming,
        }
    }

    /// Virtual mip a node at `lod` is stored in.
    fn node_mip(&self, lod: u32) -> u32 {
        let max_mip = self.params.mip_levels.saturating_sub(1) as i64;
        (lod as i64 + self.params.mip_bias as i64).clamp(0, max_mip) as u32
    }
}

impl NodeEvaluator for StreamingEvaluator<'_> {
    fn enter(&mut self, frame: &mut TraversalFrame, _selection: &mut LodSelection) -> Visit {
        if let Some(culled) = classify(self.desc, frame) {
            return Visit::Prune(culled);
        }

        let camera = self.desc.camera_position;
        let min_distance = frame.aabb.min_distance_sq(camera).sqrt();
        if min_distance > self.desc.max_visibility_distance {
            return Visit::Prune(ChildReport::of(Outcome::OutOfRange));
        }
        let max_distance = frame.aabb.max_distance_sq(camera).sqrt();
        let mips = MipInterval {
            min: self.params.mip_at_distance(min_distance),
            max: self.params.mip_at_distance(max_distance),
        };
        frame.own_mips = Some(mips);

        // Descend while some part of the node wants a finer mip than it holds.
        if frame.lod > self.desc.stop_at_lod && (mips.min.floor() as u32) < self.node_mip(frame.lod)
        {
            Visit::Descend
        } else {
            Visit::Leaf
        }
    }

    fn finish(&mut self, frame: &TraversalFrame, selection: &mut LodSelection) -> ChildReport {
        let Some(own) = frame.own_mips else {
            return ChildReport::of(Outcome::OutOfFrustum);
        };
        let needed = match frame.children_mips {
            Some(children) => own.union(children),
            None => own,
        };

        let node_mip = self.node_mip(frame.lod);
        // A node held back by `stop_at_lod` stands in for the finer mips below it.
        let finest_available = !frame.descend && (needed.min.floor() as u32) < node_mip;

        let mut selected = frame.any_child_selected;
        if finest_available || needed.contains_level(node_mip) {
            let mut node = frame.to_selected(self.desc.camera_position, [true; 4]);
            node.mip_interval = Some(needed);
            selected |= push_or_overflow(selection, node);
        }

        ChildReport {
            outcome: if selected {
                Outcome::Selected
            } else {
                Outcome::OutOfRange
            },
            mips: Some(own),
        }
    }
}
