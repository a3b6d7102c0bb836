// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod context;
pub mod flow;
pub mod hooks;
pub mod layer;
pub mod mode;
pub mod options;
pub mod platform;
