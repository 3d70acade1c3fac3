/*
 * Copyright (C) 2026 The Castellan Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Runtime controllers that keep a self-hosted cluster control plane
/// alive and evolvable.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Castellan {
    /// Emit logs as JSON instead of key=value text
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Keep designated control-plane pods runnable on this node even
    /// while the central store is unreachable
    Checkpointer(CheckpointerArgs),

    /// Converge this node's runtime configuration to the state in its
    /// node annotations
    NodeAgent(NodeAgentArgs),

    /// Drive every managed cluster component to the desired version
    UpdateController(UpdateControllerArgs),
}

#[derive(Args)]
pub struct CheckpointerArgs {
    /// Read-only endpoint serving this node's running pods
    #[arg(long, default_value = crate::castellan::checkpoint::runtime::DEFAULT_RUNTIME_PODS_URL)]
    pub runtime_endpoint: String,

    /// Namespace of the checkpointer's own pod
    #[arg(long, env = "CASTELLAN_POD_NAMESPACE")]
    pub pod_namespace: Option<String>,

    /// Name of the checkpointer's own pod
    #[arg(long, env = "CASTELLAN_POD_NAME")]
    pub pod_name: Option<String>,

    /// How long the store must confirm a parent pod absent before its
    /// checkpoint is fully collected
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub checkpoint_grace_period: Duration,

    /// Delay between reconciliation ticks
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub tick_interval: Duration,
}

#[derive(Args)]
pub struct NodeAgentArgs {
    /// Name of the node record this agent reconciles
    #[arg(long, env = "CASTELLAN_NODE_NAME")]
    pub node_name: String,
}

#[derive(Args)]
pub struct UpdateControllerArgs {
    /// Candidate identity for leader election, typically the pod name
    #[arg(long, env = "CASTELLAN_POD_NAME")]
    pub identity: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Castellan::command().debug_assert();
    }

    #[test]
    fn grace_period_parses_human_durations() {
        let cli = Castellan::try_parse_from([
            "castellan",
            "checkpointer",
            "--checkpoint-grace-period",
            "90s",
        ])
        .expect("parse");
        match cli.command {
            Commands::Checkpointer(args) => {
                assert_eq!(args.checkpoint_grace_period, Duration::from_secs(90));
            }
            _ => panic!("expected checkpointer subcommand"),
        }
    }
}
