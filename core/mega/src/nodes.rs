//! Decrypted node snapshot and path index.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use stowage_common::{Error, Result};
use stowage_crypto::{
    base64url_decode, decrypt_attributes, unwrap_node_key, FileKey, MasterKey, NodeKey,
};

/// Node type as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
    /// Cloud drive root.
    Root,
    Inbox,
    Trash,
}

impl NodeKind {
    pub fn from_wire(t: i64) -> Option<Self> {
        match t {
            0 => Some(NodeKind::File),
            1 => Some(NodeKind::Folder),
            2 => Some(NodeKind::Root),
            3 => Some(NodeKind::Inbox),
            4 => Some(NodeKind::Trash),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            NodeKind::File => 0,
            NodeKind::Folder => 1,
            NodeKind::Root => 2,
            NodeKind::Inbox => 3,
            NodeKind::Trash => 4,
        }
    }
}

/// A decrypted node.
#[derive(Debug, Clone)]
pub struct Node {
    pub handle: String,
    pub parent: Option<String>,
    pub kind: NodeKind,
    pub name: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub key: Option<NodeKey>,
}

impl Node {
    /// Whether the node can contain children.
    pub fn is_folder(&self) -> bool {
        self.kind != NodeKind::File
    }

    /// The file key of a file node.
    pub fn file_key(&self) -> Result<&FileKey> {
        match &self.key {
            Some(NodeKey::File(key)) => Ok(key),
            _ => Err(Error::InvalidInput(format!(
                "Node {} is not a file",
                self.handle
            ))),
        }
    }
}

/// Node as it appears in `f` and `p` responses.
#[derive(Debug, Deserialize)]
pub(crate) struct RawNode {
    pub h: String,
    #[serde(default)]
    pub p: Option<String>,
    pub t: i64,
    #[serde(default)]
    pub a: Option<String>,
    #[serde(default)]
    pub k: Option<String>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Public link entry of an `f` response.
#[derive(Debug, Deserialize)]
pub(crate) struct RawPublicHandle {
    pub h: String,
    pub ph: String,
}

/// Pick the key wrapped for `user_handle` from `owner:key[/owner:key...]`.
fn select_key<'a>(field: &'a str, user_handle: &str) -> Option<&'a str> {
    let mut first = None;
    for part in field.split('/') {
        let (owner, key) = part.split_once(':')?;
        if owner == user_handle {
            return Some(key);
        }
        first.get_or_insert(key);
    }
    first
}

impl RawNode {
    fn unwrap_contents(&self, master: &MasterKey, user_handle: &str) -> Result<(String, NodeKey)> {
        let wrapped = self
            .k
            .as_deref()
            .and_then(|k| select_key(k, user_handle))
            .ok_or_else(|| Error::Crypto("no key for this account".to_string()))?;
        let key = unwrap_node_key(master, &base64url_decode(wrapped)?)?;
        let attrs = base64url_decode(self.a.as_deref().unwrap_or_default())?;
        let attrs = decrypt_attributes(&attrs, key.attribute_key())?;
        Ok((attrs.name, key))
    }

    /// Decrypt into a [`Node`].
    ///
    /// Returns `None` for nodes this account cannot decrypt (foreign
    /// shares, unknown types); they are skipped rather than failing the
    /// whole snapshot.
    pub(crate) fn decrypt(self, master: &MasterKey, user_handle: &str) -> Option<Node> {
        let Some(kind) = NodeKind::from_wire(self.t) else {
            debug!("Skipping node {} of unknown type {}", self.h, self.t);
            return None;
        };

        let (name, key) = match kind {
            NodeKind::Root => ("Cloud Drive".to_string(), None),
            NodeKind::Inbox => ("Inbox".to_string(), None),
            NodeKind::Trash => ("Rubbish Bin".to_string(), None),
            NodeKind::File | NodeKind::Folder => match self.unwrap_contents(master, user_handle) {
                Ok((name, key)) => (name, Some(key)),
                Err(err) => {
                    warn!("Skipping node {}: {}", self.h, err);
                    return None;
                }
            },
        };

        Some(Node {
            handle: self.h,
            parent: self.p.filter(|p| !p.is_empty()),
            kind,
            name,
            size: self.s.unwrap_or(0),
            created: self.ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            key,
        })
    }
}

/// Immutable snapshot of the account's node tree.
///
/// Paths are relative to the cloud drive root and joined with `/`. Nodes
/// whose parent chain does not reach a root are dropped. When two nodes
/// share a path the newest one wins, ties going to the greater handle.
#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<String>>,
    by_path: HashMap<String, String>,
    public_handles: HashMap<String, String>,
    root: Option<String>,
}

impl NodeTree {
    /// Build the indexes over decrypted nodes.
    pub fn build(nodes: Vec<Node>) -> Self {
        let mut tree = NodeTree::default();
        let mut order = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.kind == NodeKind::Root && tree.root.is_none() {
                tree.root = Some(node.handle.clone());
            }
            order.push(node.handle.clone());
            tree.nodes.insert(node.handle.clone(), node);
        }

        let reachable: Vec<String> = order
            .into_iter()
            .filter(|handle| tree.reaches_top(handle))
            .collect();
        let dropped = tree.nodes.len() - reachable.len();
        if dropped > 0 {
            debug!("Dropped {} orphaned node(s) from snapshot", dropped);
            let keep: HashSet<&String> = reachable.iter().collect();
            tree.nodes.retain(|handle, _| keep.contains(handle));
        }

        for handle in &reachable {
            if let Some(parent) = tree.nodes[handle].parent.clone() {
                tree.children.entry(parent).or_default().push(handle.clone());
            }
        }

        for handle in &reachable {
            let Some(path) = tree.path_of(handle) else {
                continue;
            };
            let replace = match tree.by_path.get(&path) {
                None => true,
                Some(existing) => tree.newer(handle, existing),
            };
            if replace {
                tree.by_path.insert(path, handle.clone());
            }
        }
        tree
    }

    pub(crate) fn with_public_handles(mut self, links: Vec<RawPublicHandle>) -> Self {
        self.public_handles = links.into_iter().map(|l| (l.h, l.ph)).collect();
        self
    }

    fn reaches_top(&self, handle: &str) -> bool {
        let mut visited = HashSet::new();
        let mut current = handle;
        loop {
            if !visited.insert(current) {
                return false;
            }
            let Some(node) = self.nodes.get(current) else {
                return false;
            };
            match &node.parent {
                None => return node.kind != NodeKind::File && node.kind != NodeKind::Folder,
                Some(parent) => current = parent.as_str(),
            }
        }
    }

    fn newer(&self, candidate: &str, existing: &str) -> bool {
        let a = &self.nodes[candidate];
        let b = &self.nodes[existing];
        (a.created, &a.handle) > (b.created, &b.handle)
    }

    /// Cloud drive root.
    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref().and_then(|h| self.nodes.get(h))
    }

    /// Node by handle.
    pub fn get(&self, handle: &str) -> Option<&Node> {
        self.nodes.get(handle)
    }

    /// Node at `path` below the root; the empty path is the root itself.
    pub fn by_path(&self, path: &str) -> Option<&Node> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return self.root();
        }
        self.by_path.get(path).and_then(|h| self.nodes.get(h))
    }

    /// Path of a node below the cloud drive root.
    ///
    /// `None` for the root itself and for nodes under the inbox or trash.
    pub fn path_of(&self, handle: &str) -> Option<String> {
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.nodes.get(handle)?;
        loop {
            if !visited.insert(current.handle.as_str()) {
                return None;
            }
            match current.kind {
                NodeKind::Root => break,
                NodeKind::Inbox | NodeKind::Trash => return None,
                NodeKind::File | NodeKind::Folder => names.push(current.name.as_str()),
            }
            current = self.nodes.get(current.parent.as_deref()?)?;
        }
        if names.is_empty() {
            return None;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Direct children of a node, in server order.
    pub fn children(&self, handle: &str) -> impl Iterator<Item = &Node> {
        self.children
            .get(handle)
            .into_iter()
            .flatten()
            .filter_map(|h| self.nodes.get(h))
    }

    /// Public handle of an exported node.
    pub fn public_handle(&self, handle: &str) -> Option<&str> {
        self.public_handles.get(handle).map(String::as_str)
    }

    /// Number of reachable nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
