//! Op-placeholder insertion
//!
//! At submission time one synthetic frame per requested placeholder kind is
//! inserted under the captured calling context. Completion records later land
//! on (or below) these frames.

use crate::cct::CallingContextTree;
use gpucorr_shared::{GpuOpCcts, NodeId, NormalizedIp, PlaceholderFlags, PlaceholderKind};

/// Insert a placeholder node under `context` for every kind in `flags`.
pub fn insert_op_placeholders(
    cct: &dyn CallingContextTree,
    context: NodeId,
    flags: PlaceholderFlags,
) -> GpuOpCcts {
    let mut ccts = GpuOpCcts::default();
    for kind in flags.iter() {
        let node = cct.insert_child(context, kind.ip(), false);
        ccts.set(kind, node);
    }
    ccts
}

/// Record the launched kernel under the `kernel` and `trace` placeholders.
///
/// Both placeholders keep one child per kernel function, so repeated launches
/// of the same kernel from the same context share a node.
pub fn insert_kernel_ip(cct: &dyn CallingContextTree, ccts: &GpuOpCcts, kernel_ip: NormalizedIp) {
    if kernel_ip.is_null() {
        return;
    }
    for kind in [PlaceholderKind::Kernel, PlaceholderKind::Trace] {
        if let Some(ph) = ccts.get(kind) {
            cct.insert_child(ph, kernel_ip, true);
        }
    }
}

/// Retain every populated placeholder so trace records may reference it
pub fn retain_op_ccts(cct: &dyn CallingContextTree, ccts: &GpuOpCcts) {
    for kind in ccts.flags().iter() {
        if let Some(node) = ccts.get(kind) {
            cct.retain(node);
        }
    }
}

/// Node representing the kernel function under `placeholder`.
///
/// When the record names the function, that child is inserted (or found);
/// otherwise the child recorded at submission is used, falling back to the
/// placeholder itself.
pub fn kernel_function_node(
    cct: &dyn CallingContextTree,
    placeholder: NodeId,
    function_ip: Option<NormalizedIp>,
) -> NodeId {
    match function_ip.filter(|ip| !ip.is_null()) {
        Some(ip) => cct.insert_child(placeholder, ip, true),
        None => cct.first_child(placeholder).unwrap_or(placeholder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::ContextTree;
    use gpucorr_shared::ModuleId;

    #[test]
    fn test_insert_requested_placeholders_only() {
        let tree = ContextTree::new();
        let ctx = tree.insert_child(tree.root(), NormalizedIp::new(ModuleId(1), 0x10), false);
        let flags = PlaceholderFlags::EMPTY
            .with(PlaceholderKind::CopyIn)
            .with(PlaceholderKind::Copy);

        let ccts = insert_op_placeholders(&tree, ctx, flags);
        assert_eq!(ccts.flags(), flags);
        let copyin = ccts.get(PlaceholderKind::CopyIn).unwrap();
        assert_eq!(tree.parent(copyin), Some(ctx));
        assert_eq!(tree.addr(copyin), Some(PlaceholderKind::CopyIn.ip()));
        assert_eq!(ccts.get(PlaceholderKind::Kernel), None);
    }

    #[test]
    fn test_placeholders_are_shared_by_same_context() {
        let tree = ContextTree::new();
        let flags = PlaceholderFlags::EMPTY.with(PlaceholderKind::Sync);
        let a = insert_op_placeholders(&tree, tree.root(), flags);
        let b = insert_op_placeholders(&tree, tree.root(), flags);
        assert_eq!(a, b);
    }

    #[test]
    fn test_kernel_ip_lands_under_kernel_and_trace() {
        let tree = ContextTree::new();
        let flags = PlaceholderFlags::EMPTY
            .with(PlaceholderKind::Kernel)
            .with(PlaceholderKind::Trace);
        let ccts = insert_op_placeholders(&tree, tree.root(), flags);
        let kip = NormalizedIp::new(ModuleId(4), 0x800);
        insert_kernel_ip(&tree, &ccts, kip);
        retain_op_ccts(&tree, &ccts);

        let kernel_ph = ccts.get(PlaceholderKind::Kernel).unwrap();
        let trace_ph = ccts.get(PlaceholderKind::Trace).unwrap();
        let k = kernel_function_node(&tree, kernel_ph, None);
        let t = kernel_function_node(&tree, trace_ph, None);
        assert_eq!(tree.addr(k), Some(kip));
        assert_eq!(tree.addr(t), Some(kip));
        assert!(tree.is_retained(kernel_ph));
        assert!(tree.is_retained(trace_ph));

        // Explicit function ip finds the same child
        assert_eq!(kernel_function_node(&tree, kernel_ph, Some(kip)), k);
    }

    #[test]
    fn test_kernel_function_falls_back_to_placeholder() {
        let tree = ContextTree::new();
        let ccts = insert_op_placeholders(
            &tree,
            tree.root(),
            PlaceholderFlags::EMPTY.with(PlaceholderKind::Kernel),
        );
        let ph = ccts.get(PlaceholderKind::Kernel).unwrap();
        assert_eq!(kernel_function_node(&tree, ph, None), ph);
        assert_eq!(kernel_function_node(&tree, ph, Some(NormalizedIp::NULL)), ph);
    }
}
