//! # zygote-injector - Remote Process-Injection Engine
//!
//! Watches a root process's descendant tree for respawns of the zygote (the
//! process that spawns application processes) and hand-loads a
//! position-independent payload image into each respawn, without ever going
//! through the platform's dynamic loader and without writing shellcode into
//! the target.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ supervisor: epoll loop over SIGCHLD + control socket      │
//! │   seize root ─ classify fork/exec events ─ crash-loop     │
//! └──────────────────────────┬────────────────────────────────┘
//!                            │ one freshly exec'd zygote pid
//! ┌──────────────────────────▼────────────────────────────────┐
//! │ injection: seize ─ corrupt auxv entry ─ catch the fault   │
//! │   right before main ─ load payload ─ invoke ─ restore     │
//! └──────────────────────────┬────────────────────────────────┘
//!                            │
//! ┌──────────────────────────▼────────────────────────────────┐
//! │ image: parse the payload ELF locally, reproduce its       │
//! │   PT_LOAD layout remotely, relocate, lock protections     │
//! └──────────────────────────┬────────────────────────────────┘
//!                            │
//! ┌──────────────────────────▼────────────────────────────────┐
//! │ remote: memory/register access, per-arch call ABI,        │
//! │   remote function calls via trap-address return           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`supervisor`]: the long-lived state machine tracing the root process,
//!   with crash-loop backoff, companion daemon management and status files
//! - [`injection`]: drives one target through seize, entry interception,
//!   load, invoke, restore, release
//! - [`image`]: bounds-checked ELF parsing, remote symbol resolution and the
//!   remote loader
//! - [`remote`]: the tracee access boundary (`Tracee` trait), memory map
//!   snapshots and the per-architecture call/relocation table
//! - [`cli`], [`config`], [`status`], [`domain`]: argument parsing, path
//!   derivation, status reporting and the shared error taxonomy
//!
//! ## Key Concepts
//!
//! - **Sentinel entry**: the auxiliary vector's stored entry-point address
//!   is replaced with an invalid address, so the target's runtime loader
//!   faults exactly once after mapping the baseline libraries and before any
//!   program code runs.
//! - **Trap address**: remote calls aim their return path at a mapped but
//!   non-executable page of the target's libc; the resulting fault at a
//!   known pc is the call-completed signal.
//! - **Load bias**: the delta between an image's on-disk vaddrs and its
//!   remote base; every relocation and symbol address is shifted by it.

pub mod cli;
pub mod config;
pub mod domain;
pub mod image;
pub mod injection;
pub mod remote;
pub mod status;
pub mod supervisor;
