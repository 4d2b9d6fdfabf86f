//! Paged resources and the page merger.
//!
//! A paged key caches one [`Page`] holding every item loaded so far plus the
//! server's continuation cursor. Refetching the key resets it to the first
//! page; loading more appends the next page through [`merge`].

use std::collections::HashSet;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use url::{Position, Url};

/// Items that carry a stable identity, used to drop duplicates across pages.
pub trait Identified {
    type Id: Eq + Hash;

    fn id(&self) -> Self::Id;
}

/// An ordered run of items and the cursor for the page after it.
///
/// An absent or empty `next` means the server has no more data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<I> {
    pub items: Vec<I>,
    #[serde(default)]
    pub next: Option<String>,
}

impl<I> Page<I> {
    pub fn new(items: Vec<I>, next: Option<String>) -> Self {
        Self { items, next }
    }

    /// The continuation cursor, treating an empty string as end-of-data.
    pub fn cursor(&self) -> Option<&str> {
        self.next.as_deref().filter(|c| !c.is_empty())
    }

    pub fn has_more(&self) -> bool {
        self.cursor().is_some()
    }
}

/// Appends `next` to `previous`, dropping items already present by identity.
///
/// Items of `previous` keep their order and come first; new items follow in
/// the order the server sent them. The result carries `next`'s cursor.
/// Merging a page that has already been merged changes nothing:
/// `merge(&merge(&p1, &p2), &p2) == merge(&p1, &p2)`.
///
/// # Examples
///
/// ```
/// use swrkit::pagination::{merge, Identified, Page};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Row(u32);
///
/// impl Identified for Row {
///     type Id = u32;
///     fn id(&self) -> u32 { self.0 }
/// }
///
/// let first = Page::new(vec![Row(1), Row(2)], Some("c2".into()));
/// let second = Page::new(vec![Row(2), Row(3)], None);
///
/// let merged = merge(&first, &second);
/// assert_eq!(merged.items, vec![Row(1), Row(2), Row(3)]);
/// assert!(!merged.has_more());
/// ```
pub fn merge<I>(previous: &Page<I>, next: &Page<I>) -> Page<I>
where
    I: Identified + Clone,
{
    let mut seen: HashSet<I::Id> = previous.items.iter().map(Identified::id).collect();
    let mut items = previous.items.clone();
    for item in &next.items {
        if seen.insert(item.id()) {
            items.push(item.clone());
        }
    }
    Page {
        items,
        next: next.cursor().map(str::to_owned),
    }
}

/// Builds the key that fetches the page after `cursor`.
///
/// The cursor is appended as a form-encoded query parameter named `param`.
/// Absolute keys keep their origin; path keys stay relative.
///
/// # Errors
///
/// Returns the [`url::ParseError`] when `key` is neither an absolute URL nor
/// a path that can be resolved as one.
pub fn next_page_key(key: &str, param: &str, cursor: &str) -> Result<String, url::ParseError> {
    match Url::parse(key) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair(param, cursor);
            Ok(url.into())
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let mut url = Url::parse(RELATIVE_BASE)?.join(key)?;
            url.query_pairs_mut().append_pair(param, cursor);
            let path = &url[Position::BeforePath..];
            Ok(if key.starts_with('/') {
                path.to_owned()
            } else {
                path.trim_start_matches('/').to_owned()
            })
        }
        Err(e) => Err(e),
    }
}

/// Placeholder origin for resolving path keys; never leaves this module.
const RELATIVE_BASE: &str = "http://relative.invalid/";
