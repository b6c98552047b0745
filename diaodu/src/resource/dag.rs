//! 每个任务一张 peer 关系图。边方向为父 → 子，约束：
//! 无环、入边至多一条、根节点是种子 peer 或回源 peer。
//! 图只会在拥有该任务分片的事件 worker 里被改动，所以不需要内部锁。

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("vertex {0} not found")]
    VertexNotFound(String),

    #[error("edge {parent} -> {child} would form a cycle")]
    Cycle { parent: String, child: String },

    #[error("vertex {0} already has a parent")]
    ParentOccupied(String),
}

#[derive(Default, Debug)]
struct Vertex {
    parent: Option<String>,
    children: HashSet<String>,
}

#[derive(Default, Debug)]
pub struct Dag {
    vertices: HashMap<String, Vertex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入顶点，已存在则忽略
    pub fn add_vertex(&mut self, id: &str) {
        self.vertices.entry(id.to_string()).or_default();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vertices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// 移除顶点并切断所有关联边。
    /// 返回 (被切断的父节点, 失去父节点的子节点列表)，调用方据此做上传槽记账。
    pub fn remove_vertex(&mut self, id: &str) -> (Option<String>, Vec<String>) {
        let Some(vertex) = self.vertices.remove(id) else {
            return (None, Vec::new());
        };

        if let Some(parent) = &vertex.parent {
            if let Some(pv) = self.vertices.get_mut(parent) {
                pv.children.remove(id);
            }
        }

        let mut orphans = Vec::with_capacity(vertex.children.len());
        for child in vertex.children {
            if let Some(cv) = self.vertices.get_mut(&child) {
                cv.parent = None;
            }
            orphans.push(child);
        }

        (vertex.parent, orphans)
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.vertices.get(id).and_then(|v| v.parent.as_deref())
    }

    pub fn children_of(&self, id: &str) -> Vec<String> {
        self.vertices
            .get(id)
            .map(|v| v.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 添加父 → 子边。子节点已有父节点、成环时拒绝
    pub fn add_edge(&mut self, parent: &str, child: &str) -> Result<(), DagError> {
        if !self.vertices.contains_key(parent) {
            return Err(DagError::VertexNotFound(parent.to_string()));
        }
        if !self.vertices.contains_key(child) {
            return Err(DagError::VertexNotFound(child.to_string()));
        }
        if parent == child || self.is_ancestor(child, parent) {
            return Err(DagError::Cycle {
                parent: parent.to_string(),
                child: child.to_string(),
            });
        }
        if self.vertices[child].parent.is_some() {
            return Err(DagError::ParentOccupied(child.to_string()));
        }

        self.vertices.get_mut(parent).unwrap().children.insert(child.to_string());
        self.vertices.get_mut(child).unwrap().parent = Some(parent.to_string());
        Ok(())
    }

    /// 切断子节点的入边，返回原父节点
    pub fn remove_in_edge(&mut self, child: &str) -> Option<String> {
        let vertex = self.vertices.get_mut(child)?;
        let parent = vertex.parent.take()?;
        if let Some(pv) = self.vertices.get_mut(&parent) {
            pv.children.remove(child);
        }
        Some(parent)
    }

    /// 节点深度，根节点为 1。顶点不存在时返回 0
    pub fn depth(&self, id: &str) -> usize {
        if !self.vertices.contains_key(id) {
            return 0;
        }
        let mut depth = 1;
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// a 是否是 b 的祖先，沿 b 的父链向上走
    pub fn is_ancestor(&self, a: &str, b: &str) -> bool {
        let mut current = b;
        while let Some(parent) = self.parent_of(current) {
            if parent == a {
                return true;
            }
            current = parent;
        }
        false
    }

    /// a 是否是 b 的后代
    pub fn is_descendant(&self, a: &str, b: &str) -> bool {
        self.is_ancestor(b, a)
    }

    /// 没有父节点的顶点
    pub fn roots(&self) -> Vec<String> {
        self.vertices
            .iter()
            .filter(|(_, v)| v.parent.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
