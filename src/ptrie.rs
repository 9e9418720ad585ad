//! Patricia trie mapping large-allocation addresses to their sizes.
//!
//! Keys are chunk-aligned addresses, so their low byte is always zero; an
//! internal node stores its branch bit in the low byte of `keys[0]`. Each
//! internal node holds the keys of its two children (the full key for a leaf
//! child, some key of the subtree for an internal child) and two links. A
//! link with the low bit set is a leaf and carries the value itself; values
//! are chunk multiples, so the bit is free. The link `1` is the empty leaf.
//!
//! A trie holding one key has a root node whose branch bit is zero and whose
//! second child is the empty leaf.
//!
//! Nodes come from a private slab carved out of OS pages. Pages are mapped
//! with the lock released and never returned.

use crate::config::PTR_SIZE;
use crate::error::AllocError;
use crate::platform;
use crate::sync::SpinMutex;
use crate::{debug_log, stat_inc};
use core::ptr;

const BRANCH_MASK: usize = 0xFF;

#[derive(Clone, Copy, PartialEq, Eq)]
struct Link(usize);

impl Link {
    const EMPTY: Link = Link(1);

    #[inline]
    fn leaf(value: usize) -> Link {
        debug_assert!(value & 1 == 0);
        Link(value | 1)
    }

    #[inline]
    fn node(node: *mut Node) -> Link {
        Link(node as usize)
    }

    #[inline]
    fn is_leaf(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    fn as_node(self) -> Option<*mut Node> {
        if self.is_leaf() {
            None
        } else {
            Some(self.0 as *mut Node)
        }
    }

    #[inline]
    fn value(self) -> usize {
        self.0 & !1
    }
}

#[repr(C)]
struct Node {
    keys: [usize; 2],
    children: [Link; 2],
}

struct TrieState {
    root: Link,
    /// Spare nodes, linked through `keys[0]`.
    spare: *mut Node,
}

unsafe impl Send for TrieState {}

impl TrieState {
    fn pop_spare(&mut self) -> Option<*mut Node> {
        if self.spare.is_null() {
            return None;
        }
        let node = self.spare;
        self.spare = unsafe { (*node).keys[0] } as *mut Node;
        Some(node)
    }

    fn push_spare(&mut self, node: *mut Node) {
        unsafe { (*node).keys[0] = self.spare as usize };
        self.spare = node;
    }
}

pub struct PatriciaTrie {
    state: SpinMutex<TrieState>,
}

#[inline]
fn branch_bit(node: *const Node) -> u32 {
    (unsafe { (*node).keys[0] } & BRANCH_MASK) as u32
}

impl PatriciaTrie {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(TrieState {
                root: Link::EMPTY,
                spare: ptr::null_mut(),
            }),
        }
    }

    /// Record `value` for `key`. `key` must have a zero low byte, `value` an
    /// even value, and `key` must not be present already.
    pub fn insert(&self, key: usize, value: usize) -> Result<(), AllocError> {
        debug_assert!(key & BRANCH_MASK == 0 && key != 0);
        let mut state = self.state.lock();
        let node = loop {
            if let Some(node) = state.pop_spare() {
                break node;
            }
            drop(state);
            let page = Self::map_node_page()?;
            state = self.state.lock();
            for node in page {
                state.push_spare(node);
            }
        };
        unsafe { insert_node(&mut state.root, node, key, value) };
        Ok(())
    }

    /// Value stored for `key`, if any.
    pub fn lookup(&self, key: usize) -> Option<usize> {
        let state = self.state.lock();
        let mut link = state.root;
        let mut last_key = 0;
        while let Some(node) = link.as_node() {
            let bit = (key >> branch_bit(node)) & 1;
            unsafe {
                last_key = (*node).keys[bit];
                link = (*node).children[bit];
            }
        }
        if link == Link::EMPTY || (last_key & !BRANCH_MASK) != key {
            return None;
        }
        Some(link.value())
    }

    /// Remove `key` and return its value.
    pub fn remove(&self, key: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let mut slot: *mut Link = &mut state.root;
        let mut parent_key: *mut usize = ptr::null_mut();
        unsafe {
            loop {
                let node = (*slot).as_node()?;
                let bit = (key >> branch_bit(node)) & 1;
                let child = (*node).children[bit];
                if child.is_leaf() {
                    if child == Link::EMPTY || ((*node).keys[bit] & !BRANCH_MASK) != key {
                        return None;
                    }
                    let sibling = (*node).children[bit ^ 1];
                    if sibling.is_leaf() && sibling != Link::EMPTY && !parent_key.is_null() {
                        // The sibling leaf moves up; its parent slot must carry its key.
                        *parent_key = ((*node).keys[bit ^ 1] & !BRANCH_MASK) | (*parent_key & BRANCH_MASK);
                    }
                    *slot = sibling;
                    state.push_spare(node);
                    return Some(child.value());
                }
                parent_key = &mut (*node).keys[bit];
                slot = &mut (*node).children[bit];
            }
        }
    }

    fn map_node_page() -> Result<impl Iterator<Item = *mut Node>, AllocError> {
        let size = platform::granularity();
        let page = unsafe { platform::page_alloc(size) };
        if page.is_null() {
            debug_log!("trie node page mapping failed");
            return Err(AllocError::OutOfMemory);
        }
        stat_inc!(trie_pages);
        let count = size / core::mem::size_of::<Node>();
        Ok((0..count).map(move |i| unsafe { (page as *mut Node).add(i) }))
    }
}

/// Insert `key` using the spare `node`.
///
/// # Safety
/// `root` must be the root of a well-formed trie that does not hold `key`.
unsafe fn insert_node(root: *mut Link, node: *mut Node, key: usize, value: usize) {
    let mut slot = root;
    let mut parent_key: *mut usize = ptr::null_mut();
    let (existing, existing_key) = unsafe {
        loop {
            let link = *slot;
            if let Some(inner) = link.as_node() {
                let branch = branch_bit(inner);
                let prefix_mask = (!1usize).checked_shl(branch).unwrap_or(0);
                if (key ^ (*inner).keys[0]) & prefix_mask == 0 {
                    let bit = (key >> branch) & 1;
                    parent_key = &mut (*inner).keys[bit];
                    slot = &mut (*inner).children[bit];
                    continue;
                }
                // Key leaves this subtree's common prefix: split above it.
                break (link, (*inner).keys[0] & !BRANCH_MASK);
            }
            if link == Link::EMPTY {
                (*node).keys = [key, 0];
                (*node).children = [Link::leaf(value), Link::EMPTY];
                *slot = Link::node(node);
                return;
            }
            debug_assert!(!parent_key.is_null());
            break (link, *parent_key & !BRANCH_MASK);
        }
    };
    debug_assert!(existing_key != key, "duplicate trie key {:#x}", key);
    let diff = key ^ existing_key;
    let branch = usize::BITS - 1 - diff.leading_zeros();
    let bit = (key >> branch) & 1;
    unsafe {
        (*node).keys[bit] = key;
        (*node).keys[bit ^ 1] = existing_key;
        (*node).keys[0] |= branch as usize;
        (*node).children[bit] = Link::leaf(value);
        (*node).children[bit ^ 1] = existing;
        *slot = Link::node(node);
    }
}

const _: () = assert!(core::mem::size_of::<Node>() == 4 * PTR_SIZE);
