//! The translation service: the `TRANSLATE`/`TRANSLATED` exchange and the
//! in-transit fill of translation-typed chat messages.

use cm_protocol::{
    ChatMessage, Content, Language, Packet, Recipient, Translation, TranslationRequest, UserRef,
};
use cm_test_utils::TestClient;
use node::{Node, NodeConfig, TranslateError, TranslationBackend};
use std::sync::Arc;

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::with_server_id("S1");
    config.network.tcp_port = 0;
    config.network.udp_port = 0;
    config
}

/// Deterministic stand-in backend: tags the text with the target language.
struct TaggingBackend;

impl TranslationBackend for TaggingBackend {
    fn translate(&self, text: &str, target: Language) -> Result<String, TranslateError> {
        Ok(format!("[{target:?}] {text}"))
    }
}

struct FailingBackend;

impl TranslationBackend for FailingBackend {
    fn translate(&self, _text: &str, _target: Language) -> Result<String, TranslateError> {
        Err(TranslateError::Backend("quota exceeded".to_owned()))
    }
}

#[tokio::test]
async fn translate_request_is_answered_with_translated() {
    let node = Node::start_with_backend(test_config(), Arc::new(TaggingBackend))
        .await
        .expect("node start");
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect");

    alice
        .send(&Packet::Translate(TranslationRequest {
            target_lang: Language::De,
            original_text: "good morning".to_owned(),
            translated_text: String::new(),
        }))
        .await
        .expect("send");

    match alice.recv_non_ping().await.expect("recv") {
        Packet::Translated(reply) => {
            assert_eq!(reply.target_lang, Language::De);
            assert_eq!(reply.original_text, "good morning");
            assert_eq!(reply.translated_text, "[De] good morning");
        }
        other => panic!("expected TRANSLATED, got {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn translation_message_is_filled_in_transit() {
    let node = Node::start_with_backend(test_config(), Arc::new(TaggingBackend))
        .await
        .expect("node start");
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect a");
    let mut bob = TestClient::connect_accepted(node.tcp_addr(), "b", "S1")
        .await
        .expect("connect b");

    alice
        .send(&Packet::Message(ChatMessage {
            snowflake: 4,
            author: alice.user.clone(),
            recipient: Recipient::User(UserRef::new("b", "S1")),
            content: Content::Translation(Translation {
                target_lang: Language::Zh,
                original_text: "see you tomorrow".to_owned(),
                translated_text: String::new(),
            }),
        }))
        .await
        .expect("send");

    match bob.recv_non_ping().await.expect("recv") {
        Packet::Message(msg) => match msg.content {
            Content::Translation(t) => {
                assert_eq!(t.original_text, "see you tomorrow");
                assert_eq!(t.translated_text, "[Zh] see you tomorrow");
            }
            other => panic!("expected translation content, got {other:?}"),
        },
        other => panic!("expected MESSAGE, got {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn already_translated_message_is_not_retranslated() {
    let node = Node::start_with_backend(test_config(), Arc::new(TaggingBackend))
        .await
        .expect("node start");
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect a");
    let mut bob = TestClient::connect_accepted(node.tcp_addr(), "b", "S1")
        .await
        .expect("connect b");

    alice
        .send(&Packet::Message(ChatMessage {
            snowflake: 5,
            author: alice.user.clone(),
            recipient: Recipient::User(UserRef::new("b", "S1")),
            content: Content::Translation(Translation {
                target_lang: Language::En,
                original_text: "hallo".to_owned(),
                translated_text: "hello".to_owned(),
            }),
        }))
        .await
        .expect("send");

    match bob.recv_non_ping().await.expect("recv") {
        Packet::Message(msg) => match msg.content {
            Content::Translation(t) => {
                assert_eq!(t.translated_text, "hello", "filled text must pass through");
            }
            other => panic!("expected translation content, got {other:?}"),
        },
        other => panic!("expected MESSAGE, got {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn backend_failure_passes_the_original_text_through() {
    let node = Node::start_with_backend(test_config(), Arc::new(FailingBackend))
        .await
        .expect("node start");
    let mut alice = TestClient::connect_accepted(node.tcp_addr(), "a", "S1")
        .await
        .expect("connect");

    alice
        .send(&Packet::Translate(TranslationRequest {
            target_lang: Language::Tr,
            original_text: "unchanged".to_owned(),
            translated_text: String::new(),
        }))
        .await
        .expect("send");

    match alice.recv_non_ping().await.expect("recv") {
        Packet::Translated(reply) => {
            assert_eq!(reply.translated_text, "unchanged");
        }
        other => panic!("expected TRANSLATED, got {other:?}"),
    }

    node.shutdown().await;
}
