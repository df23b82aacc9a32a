//! Parsing of YAML deployment specs.

use pretty_assertions::assert_eq;
use rollout_core::spec::{Day, RevisionPolicy, RolloutPolicy, Step};
use rollout_spec::{SpecError, parse_spec, parse_unvalidated, to_yaml};

const PIPELINE: &str = r#"
steps:
  - instance:
      name: beta
      rollout: leading
      steps:
        - zone: { environment: test }
        - zone: { environment: staging }
        - zone: { environment: prod, region: us-east-3 }
        - test: { region: us-east-3 }
  - delay: { seconds: 3600 }
  - instance:
      name: main
      revision_policy: latest
      change_blockers:
        - revision: true
          window: { days: [sat, sun], hours: [0, 1, 2, 3] }
      steps:
        - parallel:
            - zone: { environment: prod, region: us-east-3 }
            - steps:
                - zone: { environment: prod, region: eu-west-1 }
                - delay: { seconds: 600 }
                - test: { region: eu-west-1 }
"#;

#[test]
fn test_parse_pipeline() {
    let spec = parse_spec(PIPELINE).expect("valid pipeline");
    let instances = spec.instances();
    assert_eq!(instances.len(), 2);

    let beta = instances[0];
    assert_eq!(beta.name.as_str(), "beta");
    assert_eq!(beta.rollout, RolloutPolicy::Leading);
    assert_eq!(beta.revision_policy, RevisionPolicy::Separate);
    assert_eq!(beta.steps.len(), 4);

    let main = instances[1];
    assert_eq!(main.revision_policy, RevisionPolicy::Latest);
    assert_eq!(main.change_blockers.len(), 1);
    assert!(main.change_blockers[0].revision);
    assert!(!main.change_blockers[0].platform);
    assert_eq!(main.change_blockers[0].window.days, vec![Day::Sat, Day::Sun]);
    assert!(matches!(main.steps[0], Step::Parallel(ref steps) if steps.len() == 2));

    assert_eq!(spec.steps[1].delay().num_seconds(), 3600);
}

#[test]
fn test_yaml_roundtrip_keeps_step_maps() {
    let spec = parse_spec(PIPELINE).expect("valid pipeline");
    let yaml = to_yaml(&spec).expect("render spec");
    assert!(yaml.contains("- instance:"), "steps rendered as tags:\n{yaml}");
    assert!(!yaml.contains('!'), "steps rendered as tags:\n{yaml}");

    let parsed = parse_spec(&yaml).expect("rendered spec parses");
    assert_eq!(parsed, spec);
}

#[test]
fn test_empty_document_is_empty_spec() {
    assert!(parse_spec("").unwrap().is_empty());
    assert!(parse_spec("steps: []").unwrap().is_empty());
}

#[test]
fn test_unknown_step_is_parse_error() {
    let yaml = "steps:\n  - canary: { region: us-east-3 }\n";
    assert!(matches!(parse_spec(yaml), Err(SpecError::Parse(_))));
}

#[test]
fn test_invalid_spec_is_reported_after_parsing() {
    let yaml = r#"
steps:
  - instance:
      name: default
      steps:
        - test: { region: us-east-3 }
"#;
    assert!(parse_unvalidated(yaml).is_ok());
    match parse_spec(yaml) {
        Err(SpecError::Invalid(issues)) => {
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].path, "/steps/0/instance/steps/0");
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn test_spec_error_converts_to_core_error() {
    let err: rollout_core::Error = parse_spec("steps: 3").unwrap_err().into();
    assert!(matches!(err, rollout_core::Error::InvalidSpec(_)));
}
