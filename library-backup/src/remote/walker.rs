//! Remote tree traversal.
//!
//! Walks one drive with an explicit LIFO stack instead of recursion so that
//! arbitrarily deep folder trees cannot exhaust the call stack. Entries are
//! produced lazily: a folder's children are only listed when the folder is
//! popped.

use super::{RemoteItem, RemoteSource};
use crate::Result;

/// Something the walker discovered
#[derive(Debug, Clone)]
pub enum WalkEntry {
    /// A folder at the given relative path (emitted for empty folders too)
    Directory(String),

    /// A downloadable file at the given relative path
    File { path: String, item: RemoteItem },
}

/// Depth-first, non-recursive walker over one drive.
///
/// Sibling order is unspecified: the last child listed is visited first.
pub struct TreeWalker<'a, S: RemoteSource + ?Sized> {
    source: &'a S,
    token: &'a str,
    drive_id: String,
    stack: Vec<(RemoteItem, String)>,
}

impl<'a, S: RemoteSource + ?Sized> TreeWalker<'a, S> {
    /// Seed the walker with the top-level children of `root_item_id`.
    ///
    /// `prefix` is prepended to every produced path (for example
    /// `"Finance/Documents"`); pass an empty string for drive-relative paths.
    pub async fn start(
        source: &'a S,
        token: &'a str,
        drive_id: &str,
        root_item_id: &str,
        prefix: &str,
    ) -> Result<Self> {
        let mut walker = Self {
            source,
            token,
            drive_id: drive_id.to_string(),
            stack: Vec::new(),
        };
        walker.push_children(root_item_id, prefix).await?;
        Ok(walker)
    }

    /// Next entry, or `None` once the tree is exhausted
    pub async fn next(&mut self) -> Result<Option<WalkEntry>> {
        let Some((item, parent)) = self.stack.pop() else {
            return Ok(None);
        };

        let path = join_path(&parent, &item.name);

        if item.is_folder() {
            self.push_children(&item.id, &path).await?;
            Ok(Some(WalkEntry::Directory(path)))
        } else {
            Ok(Some(WalkEntry::File { path, item }))
        }
    }

    /// Items still waiting on the stack
    pub fn pending(&self) -> usize {
        self.stack.len()
    }

    /// List every page of a folder and push its children
    async fn push_children(&mut self, item_id: &str, parent: &str) -> Result<()> {
        let mut next_link: Option<String> = None;

        loop {
            let page = self
                .source
                .list_children(self.token, &self.drive_id, item_id, next_link.as_deref())
                .await?;

            self.stack
                .extend(page.value.into_iter().map(|child| (child, parent.to_string())));

            match page.next_link {
                Some(link) => next_link = Some(link),
                None => break,
            }
        }

        Ok(())
    }
}

/// Join a relative path with forward slashes regardless of host conventions
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}
