use super::*;
use crate::mailbox::{Mail, MailPriority};
use std::time::Duration;

type Ctx = Vec<String>;

fn mail(name: &str, priority: MailPriority) -> Mail<Ctx> {
    let tag = name.to_string();
    Mail::new(name, Vec::new(), priority, move |ctx: &mut Ctx| {
        ctx.push(tag);
        Ok(())
    })
}

#[test]
fn test_fifo_within_priority() {
    let mailbox: TaskMailbox<Ctx> = TaskMailbox::new();
    mailbox.put(mail("a", MailPriority::Default)).unwrap();
    mailbox.put(mail("b", MailPriority::Default)).unwrap();
    mailbox.put(mail("c", MailPriority::Default)).unwrap();

    let mut ctx = Vec::new();
    while let Some(m) = mailbox.try_take(MailPriority::Default) {
        m.run(&mut ctx).unwrap();
    }
    assert_eq!(ctx, vec!["a", "b", "c"]);
}

#[test]
fn test_high_priority_taken_before_default() {
    let mailbox: TaskMailbox<Ctx> = TaskMailbox::new();
    mailbox.put(mail("d1", MailPriority::Default)).unwrap();
    mailbox.put(mail("h1", MailPriority::High)).unwrap();
    mailbox.put(mail("d2", MailPriority::Default)).unwrap();
    mailbox.put(mail("h2", MailPriority::High)).unwrap();

    let mut ctx = Vec::new();
    while let Some(m) = mailbox.try_take(MailPriority::Default) {
        m.run(&mut ctx).unwrap();
    }
    assert_eq!(ctx, vec!["h1", "h2", "d1", "d2"]);
}

#[test]
fn test_take_with_high_min_priority_skips_default_queue() {
    let mailbox: TaskMailbox<Ctx> = TaskMailbox::new();
    mailbox.put(mail("d1", MailPriority::Default)).unwrap();
    assert!(mailbox.try_take_high_priority().is_none());
    mailbox.put(mail("h1", MailPriority::High)).unwrap();
    let m = mailbox.try_take_high_priority().unwrap();
    assert_eq!(m.name, "h1");
}

#[test]
fn test_state_transitions_are_one_way() {
    let mailbox: TaskMailbox<Ctx> = TaskMailbox::new();
    assert_eq!(mailbox.state(), MailboxState::Open);
    assert!(mailbox.is_accepting_mails());

    mailbox.quiesce();
    assert_eq!(mailbox.state(), MailboxState::Quiesced);
    assert!(!mailbox.is_accepting_mails());

    // Quiescing again stays quiesced; closing is terminal.
    mailbox.quiesce();
    assert_eq!(mailbox.state(), MailboxState::Quiesced);
    mailbox.close();
    assert_eq!(mailbox.state(), MailboxState::Closed);
    mailbox.quiesce();
    assert_eq!(mailbox.state(), MailboxState::Closed);
}

#[test]
fn test_put_rejected_when_not_open() {
    let mailbox: TaskMailbox<Ctx> = TaskMailbox::new();
    mailbox.quiesce();
    assert_eq!(
        mailbox.put(mail("late", MailPriority::Default)),
        Err(MailboxError::Quiesced)
    );
    mailbox.close();
    assert_eq!(
        mailbox.put(mail("later", MailPriority::Default)),
        Err(MailboxError::Closed)
    );
}

#[test]
fn test_put_head_accepted_while_quiesced() {
    let mailbox: TaskMailbox<Ctx> = TaskMailbox::new();
    mailbox.put(mail("h1", MailPriority::High)).unwrap();
    mailbox.quiesce();
    mailbox.put_head(mail("wake", MailPriority::High)).unwrap();

    let mut ctx = Vec::new();
    while let Some(m) = mailbox.try_take(MailPriority::Default) {
        m.run(&mut ctx).unwrap();
    }
    // put_head goes to the front of the high-priority queue.
    assert_eq!(ctx, vec!["wake", "h1"]);

    mailbox.close();
    assert_eq!(
        mailbox.put_head(mail("dead", MailPriority::High)),
        Err(MailboxError::Closed)
    );
}

#[test]
fn test_close_drops_lingering_mails_and_wakes_taker() {
    let mailbox: std::sync::Arc<TaskMailbox<Ctx>> = std::sync::Arc::new(TaskMailbox::new());
    mailbox.put(mail("lingering", MailPriority::Default)).unwrap();

    let taker = {
        let mailbox = std::sync::Arc::clone(&mailbox);
        std::thread::spawn(move || {
            // Consume the lingering mail, then block until close.
            let first = mailbox.take(MailPriority::Default);
            let second = mailbox.take(MailPriority::Default);
            (first.is_some(), second.is_none())
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    mailbox.close();
    let (got_first, got_sentinel) = taker.join().unwrap();
    assert!(got_first);
    assert!(got_sentinel, "take must return the shutdown sentinel");
    assert!(!mailbox.has_mail());
}

#[test]
fn test_take_blocks_until_mail_arrives() {
    let mailbox: std::sync::Arc<TaskMailbox<Ctx>> = std::sync::Arc::new(TaskMailbox::new());
    let taker = {
        let mailbox = std::sync::Arc::clone(&mailbox);
        std::thread::spawn(move || mailbox.take(MailPriority::Default).map(|m| m.name))
    };
    std::thread::sleep(Duration::from_millis(20));
    mailbox.put(mail("late arrival", MailPriority::Default)).unwrap();
    assert_eq!(taker.join().unwrap().as_deref(), Some("late arrival"));
}
