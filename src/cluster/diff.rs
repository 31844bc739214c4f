//! Host-list diffing and scale planning

use super::descriptor::Cluster;

/// Split `desired` against `current` into (join, delete) sets, keeping
/// declaration order
pub fn diff(current: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let join = desired
        .iter()
        .filter(|ip| !current.contains(ip))
        .cloned()
        .collect();
    let delete = current
        .iter()
        .filter(|ip| !desired.contains(ip))
        .cloned()
        .collect();
    (join, delete)
}

/// Direction a scale operation runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
    /// Host lists already match
    None,
}

/// Hosts to join or remove
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub join_masters: Vec<String>,
    pub join_nodes: Vec<String>,
    pub delete_masters: Vec<String>,
    pub delete_nodes: Vec<String>,
}

impl ScalePlan {
    /// Build a plan from explicit lists, resolving conflicts in favour of
    /// scaling up: when anything is to be joined, delete lists are dropped
    pub fn new(
        join_masters: Vec<String>,
        join_nodes: Vec<String>,
        delete_masters: Vec<String>,
        delete_nodes: Vec<String>,
    ) -> Self {
        let mut plan = Self {
            join_masters,
            join_nodes,
            delete_masters,
            delete_nodes,
        };
        if plan.is_scale_up() && (!plan.delete_masters.is_empty() || !plan.delete_nodes.is_empty())
        {
            tracing::warn!(
                "Both join and delete hosts given, scaling up only; ignoring delete of masters {:?} nodes {:?}",
                plan.delete_masters,
                plan.delete_nodes
            );
            plan.delete_masters.clear();
            plan.delete_nodes.clear();
        }
        plan
    }

    /// Plan the move from the current to the desired descriptor
    pub fn compute(current: &Cluster, desired: &Cluster) -> Self {
        let (join_masters, delete_masters) = diff(&current.masters(), &desired.masters());
        let (join_nodes, delete_nodes) = diff(&current.nodes(), &desired.nodes());
        Self::new(join_masters, join_nodes, delete_masters, delete_nodes)
    }

    pub fn is_scale_up(&self) -> bool {
        !self.join_masters.is_empty() || !self.join_nodes.is_empty()
    }

    pub fn direction(&self) -> ScaleDirection {
        if self.is_scale_up() {
            ScaleDirection::Up
        } else if !self.delete_masters.is_empty() || !self.delete_nodes.is_empty() {
            ScaleDirection::Down
        } else {
            ScaleDirection::None
        }
    }

    /// Every host the plan joins
    pub fn joining(&self) -> Vec<String> {
        self.join_masters
            .iter()
            .chain(self.join_nodes.iter())
            .cloned()
            .collect()
    }

    /// Every host the plan removes
    pub fn deleting(&self) -> Vec<String> {
        self.delete_masters
            .iter()
            .chain(self.delete_nodes.iter())
            .cloned()
            .collect()
    }
}
