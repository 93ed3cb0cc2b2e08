//! KD-tree nearest-neighbor search
//!
//! A balanced binary tree over borrowed points; the handle's lifetime is tied
//! to the input buffer. Queries return indices sorted ascending by distance.

use std::collections::BinaryHeap;

use nalgebra::Point3;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::error::{FaceForgeError, Result};

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    point: u32,
    axis: u8,
    left: u32,
    right: u32,
}

/// KD-tree over a borrowed point buffer.
#[derive(Debug)]
pub struct KdTree<'a> {
    points: &'a [Point3<f32>],
    nodes: Vec<Node>,
    root: u32,
}

/// A k-NN query result, sorted ascending by squared distance.
#[derive(Debug, Clone)]
pub struct Neighbors {
    pub indices: Vec<usize>,
    pub distances_sq: Vec<f32>,
}

impl<'a> KdTree<'a> {
    /// Build a tree over `points`. Fails with `EmptyInput` for an empty
    /// buffer.
    pub fn build(points: &'a [Point3<f32>]) -> Result<Self> {
        if points.is_empty() {
            return Err(FaceForgeError::EmptyInput("kdtree points"));
        }
        let mut indices: Vec<u32> = (0..points.len() as u32).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = build_recursive(points, &mut indices, &mut nodes);
        Ok(Self {
            points,
            nodes,
            root,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The `k` nearest neighbors of `query`, sorted ascending by distance.
    ///
    /// When `k` exceeds the number of stored points, the last valid neighbor
    /// is repeated to pad the result to length `k`; callers that need the
    /// true neighbor count must compare against `len()`.
    pub fn knn(&self, query: &Point3<f32>, k: usize) -> Neighbors {
        let mut heap: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(k + 1);
        if k > 0 {
            self.search_knn(self.root, query, k, &mut heap);
        }

        let mut pairs: Vec<(f32, usize)> = heap
            .into_iter()
            .map(|(d, i)| (d.into_inner(), i as usize))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut indices: Vec<usize> = pairs.iter().map(|&(_, i)| i).collect();
        let mut distances_sq: Vec<f32> = pairs.iter().map(|&(d, _)| d).collect();

        // Pad by repeating the last valid neighbor (documented contract).
        while indices.len() < k {
            let last_idx = *indices.last().unwrap_or(&0);
            let last_dist = *distances_sq.last().unwrap_or(&0.0);
            indices.push(last_idx);
            distances_sq.push(last_dist);
        }

        Neighbors {
            indices,
            distances_sq,
        }
    }

    /// The single nearest neighbor: `(index, squared_distance)`.
    pub fn nearest(&self, query: &Point3<f32>) -> (usize, f32) {
        let mut best = (0usize, f32::INFINITY);
        self.search_nearest(self.root, query, &mut best);
        best
    }

    /// Nearest neighbor for every query point, in parallel.
    pub fn nearest_batch(&self, queries: &[Point3<f32>]) -> Vec<(usize, f32)> {
        queries.par_iter().map(|q| self.nearest(q)).collect()
    }

    /// Neighbors within `radius`, capped at `max_nn`, sorted ascending.
    pub fn radius(&self, query: &Point3<f32>, radius: f32, max_nn: usize) -> Neighbors {
        let radius_sq = radius * radius;
        let mut found: Vec<(f32, u32)> = Vec::new();
        self.search_radius(self.root, query, radius_sq, &mut found);
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        found.truncate(max_nn);

        Neighbors {
            indices: found.iter().map(|&(_, i)| i as usize).collect(),
            distances_sq: found.iter().map(|&(d, _)| d).collect(),
        }
    }

    fn search_knn(
        &self,
        node: u32,
        query: &Point3<f32>,
        k: usize,
        heap: &mut BinaryHeap<(OrderedFloat<f32>, u32)>,
    ) {
        if node == NIL {
            return;
        }
        let n = self.nodes[node as usize];
        let point = &self.points[n.point as usize];
        let dist_sq = (point - query).norm_squared();

        if heap.len() < k {
            heap.push((OrderedFloat(dist_sq), n.point));
        } else if let Some(&(worst, _)) = heap.peek() {
            if dist_sq < worst.into_inner() {
                heap.pop();
                heap.push((OrderedFloat(dist_sq), n.point));
            }
        }

        let axis = n.axis as usize;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };

        self.search_knn(near, query, k, heap);

        let worst = heap
            .peek()
            .map(|&(d, _)| d.into_inner())
            .unwrap_or(f32::INFINITY);
        if heap.len() < k || diff * diff < worst {
            self.search_knn(far, query, k, heap);
        }
    }

    fn search_nearest(&self, node: u32, query: &Point3<f32>, best: &mut (usize, f32)) {
        if node == NIL {
            return;
        }
        let n = self.nodes[node as usize];
        let point = &self.points[n.point as usize];
        let dist_sq = (point - query).norm_squared();
        if dist_sq < best.1 {
            *best = (n.point as usize, dist_sq);
        }

        let axis = n.axis as usize;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };

        self.search_nearest(near, query, best);
        if diff * diff < best.1 {
            self.search_nearest(far, query, best);
        }
    }

    fn search_radius(
        &self,
        node: u32,
        query: &Point3<f32>,
        radius_sq: f32,
        found: &mut Vec<(f32, u32)>,
    ) {
        if node == NIL {
            return;
        }
        let n = self.nodes[node as usize];
        let point = &self.points[n.point as usize];
        let dist_sq = (point - query).norm_squared();
        if dist_sq <= radius_sq {
            found.push((dist_sq, n.point));
        }

        let axis = n.axis as usize;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };

        self.search_radius(near, query, radius_sq, found);
        if diff * diff <= radius_sq {
            self.search_radius(far, query, radius_sq, found);
        }
    }
}

fn build_recursive(points: &[Point3<f32>], indices: &mut [u32], nodes: &mut Vec<Node>) -> u32 {
    if indices.is_empty() {
        return NIL;
    }

    // Split on the widest axis of the subset's bounds.
    let mut min = points[indices[0] as usize];
    let mut max = min;
    for &i in indices.iter() {
        let p = points[i as usize];
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    let extent = max - min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };

    let mid = indices.len() / 2;
    indices.select_nth_unstable_by(mid, |&a, &b| {
        points[a as usize][axis].total_cmp(&points[b as usize][axis])
    });
    let point = indices[mid];

    let node_slot = nodes.len() as u32;
    nodes.push(Node {
        point,
        axis: axis as u8,
        left: NIL,
        right: NIL,
    });

    let (left_half, rest) = indices.split_at_mut(mid);
    let right_half = &mut rest[1..];
    let left = build_recursive(points, left_half, nodes);
    let right = build_recursive(points, right_half, nodes);
    nodes[node_slot as usize].left = left;
    nodes[node_slot as usize].right = right;
    node_slot
}
