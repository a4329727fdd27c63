use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::ConversationId;
use crate::events::{EventSink, WorkflowEvent};

/// Conversation lifecycle. `New` has no stored header; `Persisted` carries the stored title.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    New,
    Persisted { conversation_id: ConversationId, title: String },
}

impl WorkflowState {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::New => None,
            Self::Persisted { conversation_id, .. } => Some(conversation_id),
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::New => None,
            Self::Persisted { title, .. } => Some(title),
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    FirstTurnPersisted { conversation_id: ConversationId, title: String },
    TurnPersisted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub title_changed: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifecycleTransitionError {
    #[error("conversation {0:?} is already persisted")]
    AlreadyPersisted(ConversationId),
    #[error("turn persisted before the conversation header exists")]
    HeaderMissing,
}

pub fn transition(
    current: &WorkflowState,
    event: &LifecycleEvent,
) -> Result<TransitionOutcome, LifecycleTransitionError> {
    match (current, event) {
        (WorkflowState::New, LifecycleEvent::FirstTurnPersisted { conversation_id, title }) => {
            Ok(TransitionOutcome {
                from: current.clone(),
                to: WorkflowState::Persisted {
                    conversation_id: conversation_id.clone(),
                    title: title.clone(),
                },
                title_changed: true,
            })
        }
        (WorkflowState::New, LifecycleEvent::TurnPersisted) => {
            Err(LifecycleTransitionError::HeaderMissing)
        }
        (WorkflowState::Persisted { conversation_id, .. }, LifecycleEvent::FirstTurnPersisted { .. }) => {
            Err(LifecycleTransitionError::AlreadyPersisted(conversation_id.clone()))
        }
        (WorkflowState::Persisted { .. }, LifecycleEvent::TurnPersisted) => Ok(TransitionOutcome {
            from: current.clone(),
            to: current.clone(),
            title_changed: false,
        }),
    }
}

/// Applies a transition and emits `TitleUpdated` when the conversation gained its title.
pub fn transition_with_events<S>(
    current: &WorkflowState,
    event: &LifecycleEvent,
    sink: &S,
) -> Result<TransitionOutcome, LifecycleTransitionError>
where
    S: EventSink + ?Sized,
{
    let outcome = transition(current, event)?;
    if outcome.title_changed {
        if let WorkflowState::Persisted { conversation_id, title } = &outcome.to {
            sink.emit(WorkflowEvent::TitleUpdated {
                conversation_id: conversation_id.clone(),
                title: title.clone(),
            });
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::{
        transition, transition_with_events, LifecycleEvent, LifecycleTransitionError,
        WorkflowState,
    };
    use crate::domain::conversation::ConversationId;
    use crate::events::{InMemoryEventSink, WorkflowEvent};

    fn persisted(id: &str) -> WorkflowState {
        WorkflowState::Persisted {
            conversation_id: ConversationId(id.to_string()),
            title: "Networking basics".to_string(),
        }
    }

    #[test]
    fn first_turn_moves_new_to_persisted_and_emits_title() {
        let sink = InMemoryEventSink::default();
        let outcome = transition_with_events(
            &WorkflowState::New,
            &LifecycleEvent::FirstTurnPersisted {
                conversation_id: ConversationId("c-1".to_string()),
                title: "Networking basics".to_string(),
            },
            &sink,
        )
        .expect("new -> persisted");

        assert_eq!(outcome.to, persisted("c-1"));
        assert_eq!(
            sink.events(),
            vec![WorkflowEvent::TitleUpdated {
                conversation_id: ConversationId("c-1".to_string()),
                title: "Networking basics".to_string(),
            }]
        );
    }

    #[test]
    fn persisted_state_is_one_way() {
        let error = transition(
            &persisted("c-2"),
            &LifecycleEvent::FirstTurnPersisted {
                conversation_id: ConversationId("c-3".to_string()),
                title: "Other".to_string(),
            },
        )
        .expect_err("second header insert must be rejected");

        assert_eq!(error, LifecycleTransitionError::AlreadyPersisted(ConversationId("c-2".into())));
    }

    #[test]
    fn later_turns_keep_state_without_title_event() {
        let sink = InMemoryEventSink::default();
        let outcome =
            transition_with_events(&persisted("c-4"), &LifecycleEvent::TurnPersisted, &sink)
                .expect("persisted -> persisted");

        assert_eq!(outcome.to, persisted("c-4"));
        assert!(sink.events().is_empty());
        assert!(transition(&WorkflowState::New, &LifecycleEvent::TurnPersisted).is_err());
    }
}
