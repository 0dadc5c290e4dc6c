// SPDX-License-Identifier: MIT

use super::*;
use gantry_core::test_support::{in_state, shell_target};
use gantry_core::{
    Cause, MatchPattern, StateEntry, TargetFilter, TimeConstraint,
};

fn roundtrip_up(message: UpMessage) {
    let envelope = UpEnvelope::V0(UpRequest {
        token: "secret-token".to_string(),
        message,
    });
    let json = serde_json::to_string(&envelope).unwrap();
    let parsed: UpEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(envelope, parsed);
}

fn roundtrip_down(message: DownMessage) {
    let envelope = DownEnvelope::V0(message);
    let json = serde_json::to_string(&envelope).unwrap();
    let parsed: DownEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(envelope, parsed);
}

#[test]
fn envelopes_are_externally_version_tagged() {
    let envelope = UpEnvelope::V0(UpRequest {
        token: "t".to_string(),
        message: UpMessage::GetServerStatus,
    });
    let json = serde_json::to_string(&envelope).unwrap();
    assert!(json.starts_with("{\"V0\":"));
}

#[test]
fn up_messages_roundtrip() {
    let messages = vec![
        UpMessage::GetTargets { ids: vec![] },
        UpMessage::GetTargets {
            ids: vec![TargetId::new("a"), TargetId::new("b")],
        },
        UpMessage::GetTargetSummaries {
            ids: vec![TargetId::new("a")],
        },
        UpMessage::GetTargetFlatStates {
            scope: FlatStateScope::Since(1_000_000),
            ids: vec![],
            options: QueryOptions {
                block_if_empty_at_most: Some(30),
            },
        },
        UpMessage::GetAvailableQueries {
            id: TargetId::new("a"),
        },
        UpMessage::CallQuery {
            id: TargetId::new("a"),
            query: "stdout".to_string(),
        },
        UpMessage::KillTargets {
            ids: vec![TargetId::new("a")],
        },
        UpMessage::RestartTargets {
            ids: vec![TargetId::new("a")],
        },
        UpMessage::GetTargetIds {
            query: TargetQuery {
                time_constraint: TimeConstraint::CreatedAfter(42),
                filter: TargetFilter::And(vec![
                    TargetFilter::Status(gantry_core::StatusPredicate::ReallyRunning),
                    TargetFilter::Not(Box::new(TargetFilter::Name(MatchPattern::Matches(
                        "^tmp-".to_string(),
                    )))),
                ]),
            },
            options: QueryOptions::default(),
        },
        UpMessage::GetServerStatus,
        UpMessage::GetDeferred {
            id: "deferred-1".to_string(),
            index: 100,
            length: 50,
        },
        UpMessage::Process { request: ProcessUp::ListRunning },
    ];
    for message in messages {
        roundtrip_up(message);
    }
}

#[test]
fn submit_roundtrips_with_full_targets() {
    let target = shell_target("roundtrip", "make all");
    let submission = gantry_core::TargetSubmission {
        id: target.id.clone(),
        name: target.name.clone(),
        tags: vec!["x".to_string()],
        metadata: Some(serde_json::json!({"who": "tests"})),
        dependencies: vec![TargetId::new("dep")],
        if_fails_activate: vec![TargetId::new("fb")],
        equivalence: gantry_core::Equivalence::SameMakeAndCondition,
        condition: None,
        build_process: target.build_process.clone(),
        product: None,
        active: true,
    };
    roundtrip_up(UpMessage::SubmitTargets {
        targets: vec![submission],
    });
}

#[test]
fn down_messages_roundtrip() {
    let target = in_state(
        shell_target("a", "true"),
        gantry_core::TargetState::Successful,
    );
    let messages = vec![
        DownMessage::ListOfTargets { targets: vec![target.clone()] },
        DownMessage::ListOfTargetSummaries { summaries: vec![TargetSummary::of(&target)] },
        DownMessage::ListOfTargetFlatStates { flat_states: vec![TargetFlatState::of(
            &target,
            FlatStateScope::All,
        )] },
        DownMessage::ListOfTargetIds { ids: vec![TargetId::new("a")] },
        DownMessage::DeferredListOfTargetIds {
            id: "deferred-1".to_string(),
            total: 4321,
        },
        DownMessage::Submitted {
            mapping: vec![gantry_engine::IdMapping {
                submitted: TargetId::new("dup"),
                stored: TargetId::new("canon"),
            }],
        },
        DownMessage::QueryResult { result: "stdout contents".to_string() },
        DownMessage::QueryError { error: "no such query".to_string() },
        DownMessage::Ok,
        DownMessage::MissingDeferred,
        DownMessage::Error {
            message: "nope".to_string(),
        },
        DownMessage::Process { response: ProcessDown::RunningHandles(vec![]) },
    ];
    for message in messages {
        roundtrip_down(message);
    }
}

#[test]
fn summary_carries_the_death_reason() {
    let dead = in_state(
        shell_target("a", "false"),
        gantry_core::TargetState::Dead {
            reason: "exited with code 1".to_string(),
        },
    );
    let summary = TargetSummary::of(&dead);
    assert_eq!(summary.state, StateKind::Dead);
    assert_eq!(summary.simple, SimpleStatus::Failed);
    assert_eq!(summary.error.as_deref(), Some("exited with code 1"));
}

#[test]
fn flat_states_respect_the_since_cutoff() {
    let mut target = shell_target("a", "true"); // born at 1_000_000
    target.push_entry(StateEntry::new(
        gantry_core::TargetState::Activable,
        2_000_000,
        Cause::ActivatedByUser,
    ));

    let all = TargetFlatState::of(&target, FlatStateScope::All);
    assert_eq!(all.entries.len(), 2);

    let since = TargetFlatState::of(&target, FlatStateScope::Since(1_500_000));
    assert_eq!(since.entries.len(), 1);
    assert_eq!(since.entries[0].state, StateKind::Activable);
    assert_eq!(since.entries[0].cause, "activated by user");
}
