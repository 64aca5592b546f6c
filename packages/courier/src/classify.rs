//! Inbound classification: batch unwrapping and category routing.

use crate::dispatch::{Category, EventDispatcher};
use crate::error::ProtocolError;
use crate::protocol::Envelope;

/// One classified envelope, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    /// The type-specific category, if the type has one.
    pub category: Option<Category>,
    pub envelope: Envelope,
}

impl Routed {
    /// Emit to the specific category first, then to `message`.
    pub fn deliver(&self, dispatcher: &EventDispatcher) {
        if let Some(category) = self.category {
            dispatcher.emit(category, &self.envelope);
        }
        dispatcher.emit(Category::Message, &self.envelope);
    }
}

/// Result of classifying one frame.
#[derive(Debug, Default)]
pub struct Classification {
    pub routed: Vec<Routed>,
    /// Warnings produced along the way (strict typing). The frame itself
    /// still goes through.
    pub warnings: Vec<ProtocolError>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    strict: bool,
}

impl Classifier {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Category a single non-batch envelope belongs to.
    pub fn category_of(envelope: &Envelope) -> Option<Category> {
        match envelope {
            Envelope::Heartbeat(_) => Some(Category::Heartbeat),
            Envelope::Auth(_) | Envelope::AuthResponse(_) => Some(Category::Auth),
            Envelope::Error(_) => Some(Category::Error),
            Envelope::System(_) => Some(Category::System),
            Envelope::Chat(_) | Envelope::ChatResponse(_) => Some(Category::Chat),
            Envelope::Batch(_) | Envelope::Unrecognized { .. } => None,
        }
    }

    /// Flatten `envelope` into routed events in wire order. A batch produces
    /// one event per inner message and no event of its own.
    pub fn classify(&self, envelope: Envelope) -> Classification {
        let mut out = Classification::default();
        match envelope {
            Envelope::Batch(batch) => {
                if batch.count != batch.messages.len() {
                    tracing::warn!(
                        declared = batch.count,
                        actual = batch.messages.len(),
                        "batch count does not match its messages"
                    );
                }
                for inner in batch.messages {
                    self.classify_one(inner, &mut out);
                }
            }
            other => self.classify_one(other, &mut out),
        }
        out
    }

    fn classify_one(&self, envelope: Envelope, out: &mut Classification) {
        if let Envelope::Unrecognized { kind, .. } = &envelope {
            if self.strict {
                out.warnings
                    .push(ProtocolError::UnrecognizedType(kind.clone()));
            } else {
                tracing::debug!(kind = %kind, "unrecognized message type");
            }
        }
        out.routed.push(Routed {
            category: Self::category_of(&envelope),
            envelope,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Handler;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn chat_response_routes_to_chat() {
        let env = Envelope::decode(
            r#"{"type":"chat_response","data":{"messageId":"m","conversationId":"c"}}"#,
        )
        .unwrap();
        let result = Classifier::default().classify(env);
        assert_eq!(result.routed.len(), 1);
        assert_eq!(result.routed[0].category, Some(Category::Chat));
    }

    #[test]
    fn batch_unwraps_in_order() {
        let batch = Envelope::batch(vec![
            Envelope::heartbeat(),
            Envelope::chat("m1", "c", "a"),
            Envelope::error("E", "bad"),
        ]);
        let result = Classifier::default().classify(batch);
        let categories: Vec<_> = result.routed.iter().map(|r| r.category).collect();
        assert_eq!(
            categories,
            vec![
                Some(Category::Heartbeat),
                Some(Category::Chat),
                Some(Category::Error)
            ]
        );
    }

    #[test]
    fn unrecognized_goes_to_message_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        for category in Category::ALL {
            let log = log.clone();
            dispatcher.on(
                category,
                Handler::new(move |e| log.lock().unwrap().push(e.category)),
            );
        }

        let env = Envelope::Unrecognized {
            kind: "presence".into(),
            data: json!({}),
        };
        let result = Classifier::default().classify(env);
        assert!(result.warnings.is_empty());
        for routed in &result.routed {
            routed.deliver(&dispatcher);
        }
        assert_eq!(*log.lock().unwrap(), vec![Category::Message]);
    }

    #[test]
    fn strict_mode_warns_on_unrecognized() {
        let env = Envelope::Unrecognized {
            kind: "presence".into(),
            data: json!({}),
        };
        let result = Classifier::new(true).classify(env);
        assert_eq!(result.routed.len(), 1);
        assert_eq!(
            result.warnings,
            vec![ProtocolError::UnrecognizedType("presence".into())]
        );
    }

    #[test]
    fn specific_category_fires_before_message() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        for category in [Category::Message, Category::Chat] {
            let log = log.clone();
            dispatcher.on(
                category,
                Handler::new(move |e| log.lock().unwrap().push(e.category)),
            );
        }
        let result = Classifier::default().classify(Envelope::chat("m", "c", "hi"));
        result.routed[0].deliver(&dispatcher);
        assert_eq!(*log.lock().unwrap(), vec![Category::Chat, Category::Message]);
    }
}
