//! Abstract frame-pointer-chain stack walker (§4.5, §6 "Frame layout").
//!
//! Targets are assumed to lay out native frames as a two-word chain: the current
//! frame pointer's first word is the caller's saved frame pointer, the second is
//! the return address. This is intentionally the *only* unwinder the substrate
//! ships; anything needing DWARF/CFI-based unwinding is out of scope (§1) and
//! belongs to the host's own native-interface layer.

use crate::function_map::{FunctionMap, MethodInfo};

/// One native frame, identified by its frame pointer.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    fp: usize,
}

impl Frame {
    /// Wrap a raw frame pointer.
    ///
    /// # Safety
    /// `fp` must point at a valid two-word frame (saved FP at offset 0, return
    /// address at offset 1) for as long as this `Frame` and any `Frame` produced
    /// from it via `next` are used.
    pub unsafe fn new(fp: usize) -> Self {
        Self { fp }
    }

    /// This frame's return address — the native IP to resolve against the
    /// function map.
    pub fn ip(&self) -> usize {
        // SAFETY: caller-established invariant (see `Frame::new`): offset 1 holds
        // the return address.
        unsafe { *(self.fp as *const usize).add(1) }
    }

    /// The caller's frame, or `None` once the chain reaches a null saved FP
    /// (the conventional bottom-of-stack sentinel).
    pub fn next(&self) -> Option<Frame> {
        // SAFETY: caller-established invariant: offset 0 holds the saved FP.
        let saved_fp = unsafe { *(self.fp as *const usize) };
        if saved_fp == 0 {
            None
        } else {
            Some(Frame { fp: saved_fp })
        }
    }
}

/// Walks a frame-pointer chain starting at `top`, resolving each frame's IP
/// against `functions`.
pub struct FrameWalker<'a> {
    current: Option<Frame>,
    functions: &'a FunctionMap,
}

impl<'a> FrameWalker<'a> {
    /// # Safety
    /// `top` must satisfy the same invariant as [`Frame::new`].
    pub unsafe fn new(top: usize, functions: &'a FunctionMap) -> Self {
        Self {
            current: Some(Frame::new(top)),
            functions,
        }
    }
}

impl<'a> Iterator for FrameWalker<'a> {
    type Item = (Frame, Option<MethodInfo>);

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.current.take()?;
        self.current = frame.next();
        let info = self.functions.ip_to_method_info(frame.ip());
        Some((frame, info))
    }
}

/// Reflection primitive: the method that called into the frame at `top`, i.e. the
/// first entry of the walk. Used by security-frame lookups (§4.5).
///
/// # Safety
/// Same invariant as [`Frame::new`].
pub unsafe fn calling_assembly(top: usize, functions: &FunctionMap) -> Option<MethodInfo> {
    FrameWalker::new(top, functions).next().and_then(|(_, info)| info)
}

/// Reflection primitive: the method `depth` frames up from `top` (0 is the frame
/// at `top` itself). Returns `None` once the walk runs past the bottom of the
/// managed stack (§4.5: "results for depths past the bottom... are `None`").
///
/// # Safety
/// Same invariant as [`Frame::new`].
pub unsafe fn caller_class(top: usize, depth: usize, functions: &FunctionMap) -> Option<MethodInfo> {
    FrameWalker::new(top, functions)
        .nth(depth)
        .and_then(|(_, info)| info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmId;

    /// A fabricated two-word frame chain laid out in an array we control, so the
    /// walker can be exercised without touching the real native stack.
    #[repr(C)]
    struct FakeFrame {
        saved_fp: usize,
        return_address: usize,
    }

    #[test]
    fn walks_chain_and_resolves_methods() {
        let functions = FunctionMap::new();
        functions.add_method_info(MethodInfo {
            owner: VmId(0),
            start: 0x1000,
            end: Some(0x1100),
            token: 1,
        });
        functions.add_method_info(MethodInfo {
            owner: VmId(0),
            start: 0x2000,
            end: Some(0x2100),
            token: 2,
        });

        let mut bottom = FakeFrame {
            saved_fp: 0,
            return_address: 0x1050,
        };
        let mut top = FakeFrame {
            saved_fp: &mut bottom as *mut FakeFrame as usize,
            return_address: 0x2050,
        };

        let walk: Vec<_> = unsafe { FrameWalker::new(&mut top as *mut FakeFrame as usize, &functions) }
            .map(|(_, info)| info.map(|i| i.token))
            .collect();

        assert_eq!(walk, vec![Some(2), Some(1)]);
    }

    #[test]
    fn caller_class_past_bottom_of_stack_is_none() {
        let functions = FunctionMap::new();
        let mut only = FakeFrame {
            saved_fp: 0,
            return_address: 0x9000,
        };
        let top = &mut only as *mut FakeFrame as usize;

        assert!(unsafe { caller_class(top, 0, &functions) }.is_none());
        assert!(unsafe { caller_class(top, 1, &functions) }.is_none());
    }
}
