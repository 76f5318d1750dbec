// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Plan graph rendering for stuck-query debugging.

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use super::emitter::EmitterRef;
use crate::exec::batch::Batch;

/// Render the emitter tree below `root`, one stage per line. A stage reached
/// a second time (diamond plans) is printed as a back reference.
pub fn render_graph<B: Batch>(root: &EmitterRef<B>) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    render_node(root, 0, &mut seen, &mut out);
    out
}

fn render_node<B: Batch>(
    node: &EmitterRef<B>,
    depth: usize,
    seen: &mut HashSet<usize>,
    out: &mut String,
) {
    let id = Arc::as_ptr(node) as *const () as usize;
    let indent = "  ".repeat(depth);
    if !seen.insert(id) {
        let _ = writeln!(out, "{indent}^ {}", node.name());
        return;
    }
    let _ = writeln!(out, "{indent}{}", node.state_label());
    for upstream in node.upstreams() {
        render_node(&upstream, depth + 1, seen, out);
    }
}
