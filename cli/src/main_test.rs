use super::*;

fn invite(product: &str, buyer: &str) -> ChatInvite {
    ChatInvite {
        product_id: product.to_owned(),
        counterpart_id: buyer.to_owned(),
        counterpart_name: String::new(),
        product_name: None,
    }
}

fn buyers(printed: &[&ChatInvite]) -> Vec<String> {
    printed.iter().map(|i| i.counterpart_id.clone()).collect()
}

#[test]
fn unseen_prints_each_invite_once() {
    let mut seen = HashSet::new();
    let queue = vec![invite("p1", "b1"), invite("p1", "b2")];
    assert_eq!(buyers(&unseen(&mut seen, &queue, ChatInvite::key)), vec!["b1", "b2"]);
    assert!(unseen(&mut seen, &queue, ChatInvite::key).is_empty());
}

#[test]
fn unseen_detects_new_invite_in_full_queue() {
    let mut seen = HashSet::new();
    let full = vec![invite("p1", "b1"), invite("p1", "b2")];
    unseen(&mut seen, &full, ChatInvite::key);

    // Oldest evicted, newest appended: same length, different content.
    let rotated = vec![invite("p1", "b2"), invite("p1", "b3")];
    assert_eq!(buyers(&unseen(&mut seen, &rotated, ChatInvite::key)), vec!["b3"]);
}

#[test]
fn unseen_after_pruning_neither_skips_nor_repeats() {
    let mut seen = HashSet::new();
    unseen(&mut seen, &[invite("p1", "b1"), invite("p1", "b2")], ChatInvite::key);

    let pruned = vec![invite("p1", "b2"), invite("p2", "b3")];
    assert_eq!(buyers(&unseen(&mut seen, &pruned, ChatInvite::key)), vec!["b3"]);

    // An expired invite that arrives again is news.
    let returned = vec![invite("p1", "b2"), invite("p2", "b3"), invite("p1", "b1")];
    assert_eq!(buyers(&unseen(&mut seen, &returned, ChatInvite::key)), vec!["b1"]);
}

#[test]
fn recv_update_breaks_when_sender_is_gone() {
    let (tx, mut rx) = broadcast::channel::<ConversationUpdate>(4);
    tx.send(ConversationUpdate::Joined { product_id: "p1".into() }).unwrap();
    drop(tx);

    let first = recv_update(rx.try_recv().map_err(|_| broadcast::error::RecvError::Closed), conversation_json);
    assert_eq!(first, ControlFlow::Continue(Some(json!({"type": "joined", "productId": "p1"}))));
    assert_eq!(
        recv_update::<ConversationUpdate>(Err(broadcast::error::RecvError::Closed), conversation_json),
        ControlFlow::Break(())
    );
    assert_eq!(
        recv_update::<ConversationUpdate>(Err(broadcast::error::RecvError::Lagged(3)), conversation_json),
        ControlFlow::Continue(None)
    );
}
