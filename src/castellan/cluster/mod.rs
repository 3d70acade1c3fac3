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

pub mod components;
pub mod controller;
pub mod election;
pub mod version;

pub use controller::{
    UpdateController, CLUSTER_CONFIG_MAP_NAME, CLUSTER_VERSION_KEY, MANAGED_LABEL,
};
pub use election::{LeaderElectionConfig, LeaderElector};
pub use version::Version;
