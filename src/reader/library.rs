//! Library outline: books with their chapters as an expandable tree.
//!
//! Expansion is private per-node state owned by the tree. Rebuilding the tree
//! (a remount) collapses everything. Sibling order is the store's order.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::models::{ChapterRef, LibraryBook};
use super::render::escape_html;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeId {
    Book(i64),
    Chapter(i64),
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Book(id) => write!(f, "book-{}", id),
            Self::Chapter(id) => write!(f, "chapter-{}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlineNode {
    pub id: NodeId,
    pub title: String,
    pub expanded: bool,
    pub children: Vec<OutlineNode>,
    #[serde(skip)]
    chapter: Option<ChapterRef>,
}

impl OutlineNode {
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

/// What a click on an outline node did.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickOutcome {
    /// New expansion state, if the node has children.
    pub expanded: Option<bool>,
    /// Chapter to select, if the node is a chapter.
    pub select: Option<ChapterRef>,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryTree {
    roots: Vec<OutlineNode>,
}

impl LibraryTree {
    pub fn new(library: &[LibraryBook]) -> Self {
        let roots = library
            .iter()
            .map(|lb| OutlineNode {
                id: NodeId::Book(lb.book.id),
                title: lb.book.title.clone(),
                expanded: false,
                children: lb
                    .children
                    .iter()
                    .map(|chapter| OutlineNode {
                        id: NodeId::Chapter(chapter.id),
                        title: chapter.title.clone(),
                        expanded: false,
                        children: Vec::new(),
                        chapter: Some(ChapterRef::from(chapter)),
                    })
                    .collect(),
                chapter: None,
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[OutlineNode] {
        &self.roots
    }

    fn find_mut(&mut self, id: NodeId) -> Option<&mut OutlineNode> {
        fn walk(nodes: &mut [OutlineNode], id: NodeId) -> Option<&mut OutlineNode> {
            for node in nodes {
                if node.id == id {
                    return Some(node);
                }
                if let Some(found) = walk(&mut node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.roots, id)
    }

    fn find(&self, id: NodeId) -> Option<&OutlineNode> {
        fn walk(nodes: &[OutlineNode], id: NodeId) -> Option<&OutlineNode> {
            nodes.iter().find_map(|node| {
                if node.id == id {
                    Some(node)
                } else {
                    walk(&node.children, id)
                }
            })
        }
        walk(&self.roots, id)
    }

    /// Chapter summary for a chapter node, if it is in the outline.
    pub fn chapter_ref(&self, chapter_id: i64) -> Option<ChapterRef> {
        self.find(NodeId::Chapter(chapter_id))
            .and_then(|n| n.chapter.clone())
    }

    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.find(id).is_some_and(|n| n.expanded)
    }

    /// Handle a click: toggle expansion when the node has children, and
    /// report the chapter to select when it is a chapter node.
    /// Returns `None` for an unknown node.
    pub fn click(&mut self, id: NodeId) -> Option<ClickOutcome> {
        let node = self.find_mut(id)?;
        let expanded = if node.has_children() {
            node.expanded = !node.expanded;
            Some(node.expanded)
        } else {
            None
        };
        let select = match node.id {
            NodeId::Chapter(_) => node.chapter.clone(),
            NodeId::Book(_) => None,
        };
        Some(ClickOutcome { expanded, select })
    }

    /// Render the outline as nested lists. Collapsed children are omitted.
    pub fn render_html(&self, selected_chapter: Option<i64>) -> String {
        fn render_nodes(out: &mut String, nodes: &[OutlineNode], selected: Option<i64>) {
            out.push_str("<ul class=\"outline\">");
            for node in nodes {
                let active = matches!(node.id, NodeId::Chapter(id) if Some(id) == selected);
                let _ = write!(
                    out,
                    "<li data-node=\"{}\"{}>{}",
                    node.id,
                    if active { " class=\"active\"" } else { "" },
                    escape_html(&node.title)
                );
                if node.has_children() && node.expanded {
                    render_nodes(out, &node.children, selected);
                }
                out.push_str("</li>");
            }
            out.push_str("</ul>");
        }

        if self.roots.is_empty() {
            return "<p class=\"outline-empty\">No books yet.</p>".to_string();
        }
        let mut out = String::new();
        render_nodes(&mut out, &self.roots, selected_chapter);
        out
    }
}
