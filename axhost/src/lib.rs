// SPDX-License-Identifier: GPL-3.0-or-later

//! Out-of-process host for COM/ActiveX controls.
//!
//! Runs either as the DllSurrogate of an in-process control or as a
//! standalone local server registering one or more classes. Every object a
//! client gets back is a [`container::HostContainer`] wrapping the real
//! control, so event sinks, class info and process lifetime stay under the
//! host's control.

pub mod class_info;
pub mod class_spec;
pub mod cli;
pub mod com_init;
pub mod connection_point;
pub mod connection_point_container;
pub mod container;
pub mod event_loop;
pub mod external_connection;
pub mod factory;
pub mod guid;
pub mod lifetime;
pub mod logging;
pub mod notify;
pub mod ready_event;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod sink;
pub mod surrogate;
mod worker_pool;

#[cfg(test)]
mod test_support;
