//! Kubernetes adapter: `exec` against a pod over the API server's exec
//! subresource (spec.md §4.6).
//!
//! New to this crate — the teacher has no Kubernetes support. Grounded on
//! the `kube` crate's `Api<Pod>::exec`/`AttachParams`/`AttachedProcess`
//! shape (`other_examples/1e50f522_kube-rs-kube...api-subresource.rs`):
//! `exec` returns an `AttachedProcess` multiplexing stdout/stderr over the
//! same WebSocket connection, with a `take_stdout`/`take_stderr` pair and a
//! `join`/`termination_status` to learn how the remote command ended —
//! the same shape [`crate::adapters::RunningProcess`] already expects from
//! the other substrates.

mod adapter;
pub mod ops;

pub use adapter::KubernetesAdapter;
