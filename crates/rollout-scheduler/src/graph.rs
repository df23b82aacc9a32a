//! Dependency graph of the primitive steps of a deployment spec.

use chrono::Duration;
use petgraph::Direction;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use rollout_core::application::Application;
use rollout_core::job::{Environment, JobType, ZoneId};
use rollout_core::spec::{InstanceSpec, Step};
use rollout_core::{Error, InstanceName, JobId, Result};
use std::collections::{HashMap, HashSet};

/// What a node in the step graph represents.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// An instance; complete when its dependencies are, for changes it has adopted.
    Instance(Box<InstanceSpec>),
    /// A fixed wait after its dependencies complete.
    Delay(Duration),
    /// A system or staging test.
    TestDeployment,
    /// A production test, verifying the deployment in its region.
    ProductionTest,
    ProductionDeployment,
}

/// A node in the step graph.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub kind: StepKind,
    pub instance: InstanceName,
    pub job: Option<JobId>,
    /// False for the system and staging tests added to instances which do not declare them.
    pub declared: bool,
}

impl StepNode {
    pub fn is_test(&self) -> bool {
        matches!(self.kind, StepKind::TestDeployment | StepKind::ProductionTest)
    }
}

/// The steps of a deployment spec, with an edge from each step to every step which directly
/// depends on it. Job steps are kept in declaration order.
#[derive(Debug, Default)]
pub struct StepGraph {
    graph: DiGraph<StepNode, ()>,
    all_steps: Vec<NodeIndex>,
    job_order: Vec<JobId>,
    job_steps: HashMap<JobId, NodeIndex>,
    instances: HashMap<InstanceName, NodeIndex>,
}

impl StepGraph {
    /// Build the step graph for the deployment spec of the given application.
    ///
    /// Fails if the spec declares an instance the application does not have, or a job
    /// which cannot be derived from its step.
    pub fn build(application: &Application) -> Result<Self> {
        let mut builder = GraphBuilder {
            application,
            graph: StepGraph::default(),
        };
        let mut previous = Vec::new();
        for step in &application.deployment_spec.steps {
            previous = builder.fill(step, previous, None)?;
        }
        Ok(builder.graph)
    }

    pub fn node(&self, index: NodeIndex) -> &StepNode {
        &self.graph[index]
    }

    /// Direct dependencies of the given step.
    pub fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    pub fn job_step(&self, job: &JobId) -> Option<NodeIndex> {
        self.job_steps.get(job).copied()
    }

    /// Job steps, in declaration order.
    pub fn job_steps(&self) -> impl Iterator<Item = (&JobId, NodeIndex)> + '_ {
        self.job_order
            .iter()
            .filter_map(|job| self.job_steps.get(job).map(|index| (job, *index)))
    }

    /// All steps, in declaration order, with implicit tests after their instance.
    pub fn all_steps(&self) -> &[NodeIndex] {
        &self.all_steps
    }

    pub fn instance_step(&self, instance: &InstanceName) -> Option<NodeIndex> {
        self.instances.get(instance).copied()
    }

    pub fn instance_spec(&self, instance: &InstanceName) -> Option<&InstanceSpec> {
        self.instance_step(instance)
            .and_then(|index| match &self.graph[index].kind {
                StepKind::Instance(spec) => Some(spec.as_ref()),
                _ => None,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.all_steps.is_empty()
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// All steps the given step depends on, directly or transitively.
    pub fn all_dependencies(&self, index: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut pending: Vec<NodeIndex> = self.dependencies(index).collect();
        while let Some(next) = pending.pop() {
            if seen.insert(next) {
                pending.extend(self.dependencies(next));
            }
        }
        seen
    }

    /// Steps on any path from `dependency` to `dependent`, both included.
    pub fn steps_between(&self, dependency: NodeIndex, dependent: NodeIndex) -> HashSet<NodeIndex> {
        let mut visited = HashSet::new();
        let mut between = HashSet::new();
        self.fill_between(dependency, dependent, &mut visited, &mut between);
        between
    }

    fn fill_between(
        &self,
        dependency: NodeIndex,
        current: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        between: &mut HashSet<NodeIndex>,
    ) -> bool {
        if !visited.insert(current) {
            return between.contains(&current);
        }
        if current == dependency {
            between.insert(current);
        } else {
            let dependencies: Vec<NodeIndex> = self.dependencies(current).collect();
            for next in dependencies {
                if self.fill_between(dependency, next, visited, between) {
                    between.insert(current);
                }
            }
        }
        between.contains(&current)
    }
}

struct GraphBuilder<'a> {
    application: &'a Application,
    graph: StepGraph,
}

impl GraphBuilder<'_> {
    /// Add the primitive steps of `step`, depending on `previous`, and return what later steps depend on.
    fn fill(
        &mut self,
        step: &Step,
        previous: Vec<NodeIndex>,
        instance: Option<&InstanceName>,
    ) -> Result<Vec<NodeIndex>> {
        match step {
            Step::Instance(spec) => self.fill_instance(spec, previous),
            Step::Steps(steps) => {
                let mut previous = previous;
                for nested in steps {
                    previous = self.fill(nested, previous, instance)?;
                }
                Ok(previous)
            }
            Step::Parallel(steps) if steps.is_empty() => Ok(previous),
            Step::Parallel(steps) => {
                let mut frontier: Vec<NodeIndex> = Vec::new();
                for nested in steps {
                    for index in self.fill(nested, previous.clone(), instance)? {
                        if !frontier.contains(&index) {
                            frontier.push(index);
                        }
                    }
                }
                Ok(frontier)
            }
            Step::Delay(delay) => {
                // Leaves outside all instances cannot be attributed to one, and are ignored.
                let Some(instance) = instance else {
                    return Ok(previous);
                };
                let duration = delay.duration();
                if duration.is_zero() {
                    return Ok(previous);
                }
                let index = self.add(StepKind::Delay(duration), instance, None, true, &previous);
                self.graph.all_steps.push(index);
                Ok(vec![index])
            }
            Step::Zone(zone) => {
                let Some(instance) = instance else {
                    return Ok(previous);
                };
                match (zone.environment, &zone.region) {
                    (Environment::Test | Environment::Staging, _) => {
                        let job_type = JobType::deployment_to(&ZoneId::new(
                            zone.environment,
                            ZoneId::DEFAULT_REGION,
                        ));
                        let job = self.job(instance, job_type);
                        let index =
                            self.add(StepKind::TestDeployment, instance, Some(job.clone()), true, &[]);
                        self.register(job, index);
                        let mut previous = previous;
                        previous.push(index);
                        Ok(previous)
                    }
                    (Environment::Prod, Some(region)) => {
                        let job = self.job(instance, JobType::ProductionDeployment(region.clone()));
                        let index = self.add(
                            StepKind::ProductionDeployment,
                            instance,
                            Some(job.clone()),
                            true,
                            &previous,
                        );
                        self.register(job, index);
                        Ok(vec![index])
                    }
                    (Environment::Prod, None) => Err(Error::InconsistentSpec(format!(
                        "{} declares a production zone without a region",
                        self.application.id
                    ))),
                    _ => Ok(previous),
                }
            }
            Step::Test(test) => {
                let Some(instance) = instance else {
                    return Ok(previous);
                };
                let job = self.job(instance, JobType::test_of(&test.region));
                let index = self.add(
                    StepKind::ProductionTest,
                    instance,
                    Some(job.clone()),
                    true,
                    &previous,
                );
                self.register(job, index);
                Ok(vec![index])
            }
        }
    }

    fn fill_instance(
        &mut self,
        spec: &InstanceSpec,
        previous: Vec<NodeIndex>,
    ) -> Result<Vec<NodeIndex>> {
        if self.application.instance(&spec.name).is_none() {
            return Err(Error::InconsistentSpec(format!(
                "{} declares instance '{}', which does not exist",
                self.application.id, spec.name
            )));
        }

        let index = self.add(
            StepKind::Instance(Box::new(spec.clone())),
            &spec.name,
            None,
            true,
            &previous,
        );
        self.graph.all_steps.push(index);
        self.graph.instances.insert(spec.name.clone(), index);

        for test_type in [JobType::SystemTest, JobType::StagingTest] {
            let job = self.job(&spec.name, test_type);
            if !self.graph.job_steps.contains_key(&job) {
                let test = self.add(StepKind::TestDeployment, &spec.name, Some(job.clone()), false, &[]);
                self.graph.job_order.push(job.clone());
                self.graph.job_steps.insert(job, test);
                self.graph.all_steps.push(test);
            }
        }

        let mut previous = vec![index];
        for nested in &spec.steps {
            previous = self.fill(nested, previous, Some(&spec.name))?;
        }
        Ok(previous)
    }

    fn job(&self, instance: &InstanceName, job_type: JobType) -> JobId {
        JobId::new(self.application.id.instance(instance.clone()), job_type)
    }

    fn add(
        &mut self,
        kind: StepKind,
        instance: &InstanceName,
        job: Option<JobId>,
        declared: bool,
        dependencies: &[NodeIndex],
    ) -> NodeIndex {
        let index = self.graph.graph.add_node(StepNode {
            kind,
            instance: instance.clone(),
            job,
            declared,
        });
        for dependency in dependencies {
            self.graph.graph.add_edge(*dependency, index, ());
        }
        index
    }

    /// Register a declared job step, replacing any earlier step for the same job.
    /// The job keeps its original position in the declaration order.
    fn register(&mut self, job: JobId, index: NodeIndex) {
        let graph = &mut self.graph;
        graph
            .all_steps
            .retain(|existing| graph.graph[*existing].job.as_ref() != Some(&job));
        graph.all_steps.push(index);
        if graph.job_steps.insert(job.clone(), index).is_none() {
            graph.job_order.push(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rollout_core::spec::{DeclaredTest, DeclaredZone, DelayStep, DeploymentSpec};

    fn names(graph: &StepGraph) -> Vec<String> {
        graph
            .all_steps()
            .iter()
            .map(|index| {
                let node = graph.node(*index);
                match (&node.kind, &node.job) {
                    (_, Some(job)) => format!("{}:{}", node.instance, job.job_type),
                    (StepKind::Instance(_), None) => format!("{}", node.instance),
                    (StepKind::Delay(delay), None) => format!("delay {}s", delay.num_seconds()),
                    _ => "?".to_string(),
                }
            })
            .collect()
    }

    fn job_types(graph: &StepGraph, indices: impl Iterator<Item = NodeIndex>) -> Vec<String> {
        let mut types: Vec<String> = indices
            .map(|index| match &graph.node(index).job {
                Some(job) => job.job_type.to_string(),
                None => format!("{}", graph.node(index).instance),
            })
            .collect();
        types.sort();
        types
    }

    #[test]
    fn test_implicit_tests_replaced_by_declared() {
        let spec = DeploymentSpec::new(vec![instance(
            "default",
            vec![
                Step::Zone(DeclaredZone::test()),
                Step::Zone(DeclaredZone::prod("us-east-3")),
            ],
        )]);
        let graph = StepGraph::build(&application_with(spec)).unwrap();
        assert_eq!(
            names(&graph),
            vec![
                "default",
                "default:staging-test",
                "default:system-test",
                "default:production-us-east-3"
            ]
        );

        let system = graph.job_step(&job("default", JobType::SystemTest)).unwrap();
        let staging = graph.job_step(&job("default", JobType::StagingTest)).unwrap();
        assert!(graph.node(system).declared);
        assert!(!graph.node(staging).declared);

        // Declared jobs keep their first position in the job order.
        let order: Vec<String> = graph.job_steps().map(|(job, _)| job.job_type.to_string()).collect();
        assert_eq!(order, vec!["system-test", "staging-test", "production-us-east-3"]);

        let production = graph.job_step(&prod_job("default", "us-east-3")).unwrap();
        assert_eq!(
            job_types(&graph, graph.dependencies(production)),
            vec!["default", "system-test"]
        );
    }

    #[test]
    fn test_parallel_frontier_and_delays() {
        let spec = DeploymentSpec::new(vec![instance(
            "default",
            vec![
                Step::Parallel(vec![
                    Step::Zone(DeclaredZone::prod("us-east-3")),
                    Step::Steps(vec![
                        Step::Zone(DeclaredZone::prod("eu-west-1")),
                        Step::Delay(DelayStep { seconds: 0 }),
                        Step::Test(DeclaredTest {
                            region: "eu-west-1".into(),
                        }),
                    ]),
                ]),
                Step::Delay(DelayStep { seconds: 600 }),
                Step::Zone(DeclaredZone::prod("ap-northeast-1")),
            ],
        )]);
        let graph = StepGraph::build(&application_with(spec)).unwrap();

        let eu_test = graph.job_step(&test_job("default", "eu-west-1")).unwrap();
        assert_eq!(
            job_types(&graph, graph.dependencies(eu_test)),
            vec!["production-eu-west-1"]
        );

        let ap = graph.job_step(&prod_job("default", "ap-northeast-1")).unwrap();
        let delay: Vec<NodeIndex> = graph.dependencies(ap).collect();
        assert_eq!(delay.len(), 1);
        assert_eq!(graph.node(delay[0]).kind, StepKind::Delay(Duration::seconds(600)));
        assert_eq!(
            job_types(&graph, graph.dependencies(delay[0])),
            vec!["production-us-east-3", "test-eu-west-1"]
        );
        assert!(graph.is_acyclic());
    }

    #[test]
    fn test_leaves_outside_instances_are_ignored() {
        let spec = DeploymentSpec::new(vec![
            Step::Zone(DeclaredZone::test()),
            Step::Delay(DelayStep { seconds: 60 }),
            instance("default", vec![]),
        ]);
        let graph = StepGraph::build(&application_with(spec)).unwrap();
        assert_eq!(
            names(&graph),
            vec!["default", "default:system-test", "default:staging-test"]
        );
        let default = graph.instance_step(&"default".into()).unwrap();
        assert_eq!(graph.dependencies(default).count(), 0);
    }

    #[test]
    fn test_instances_depend_on_upstream_instances() {
        let spec = DeploymentSpec::new(vec![
            instance("beta", vec![Step::Zone(DeclaredZone::prod("us-east-3"))]),
            instance("main", vec![Step::Zone(DeclaredZone::prod("us-east-3"))]),
        ]);
        let graph = StepGraph::build(&application_with(spec)).unwrap();
        let main = graph.instance_step(&"main".into()).unwrap();
        let upstream = graph.all_dependencies(main);
        assert!(upstream.contains(&graph.instance_step(&"beta".into()).unwrap()));
        assert!(upstream.contains(&graph.job_step(&prod_job("beta", "us-east-3")).unwrap()));

        let beta_prod = graph.job_step(&prod_job("beta", "us-east-3")).unwrap();
        let main_prod = graph.job_step(&prod_job("main", "us-east-3")).unwrap();
        assert_eq!(graph.steps_between(beta_prod, main_prod).len(), 3);
        assert!(graph.steps_between(main_prod, beta_prod).is_empty());
    }

    #[test]
    fn test_unknown_instance_is_inconsistent() {
        let spec = DeploymentSpec::new(vec![instance("default", vec![])]);
        let mut application = application_with(spec);
        application.instances.clear();
        assert!(matches!(
            StepGraph::build(&application),
            Err(Error::InconsistentSpec(_))
        ));
    }

    fn arb_leaf() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Zone(DeclaredZone::test())),
            Just(Step::Zone(DeclaredZone::staging())),
            (0..4u8).prop_map(|region| Step::Zone(DeclaredZone::prod(format!("region-{region}")))),
            (0..4u8).prop_map(|region| Step::Test(DeclaredTest {
                region: format!("region-{region}").into(),
            })),
            (0..3u64).prop_map(|seconds| Step::Delay(DelayStep { seconds })),
        ]
    }

    fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
        let tree = arb_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Step::Steps),
                prop::collection::vec(inner, 0..4).prop_map(Step::Parallel),
            ]
        });
        prop::collection::vec(tree, 0..5)
    }

    proptest! {
        #[test]
        fn prop_graph_is_acyclic(first in arb_steps(), second in arb_steps(), parallel in any::<bool>()) {
            let instances = vec![instance("first", first), instance("second", second)];
            let spec = DeploymentSpec::new(if parallel {
                vec![Step::Parallel(instances)]
            } else {
                instances
            });
            let graph = StepGraph::build(&application_with(spec)).unwrap();
            prop_assert!(graph.is_acyclic());
            for (job, index) in graph.job_steps() {
                prop_assert_eq!(graph.node(index).job.as_ref(), Some(job));
                prop_assert!(graph.dependencies(index).all(|dependency| dependency != index));
            }
            for name in ["first", "second"] {
                for test_type in [JobType::SystemTest, JobType::StagingTest] {
                    prop_assert!(graph.job_step(&job(name, test_type)).is_some());
                }
            }
        }
    }
}
