//! 通用有限状态机引擎。状态、事件、迁移表由使用方定义，
//! 引擎只负责校验迁移是否合法，并把生效的迁移通知给观察者。

use std::fmt::Debug;

use thiserror::Error;

/// 非法迁移
#[derive(Debug, Error, PartialEq, Eq)]
#[error("event {event:?} rejected in state {from:?}")]
pub struct FsmError<S: Debug, E: Debug> {
    pub event: E,
    pub from: S,
}

/// 一次已生效的状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub event: E,
    pub from: S,
    pub to: S,
}

/// 迁移表的一行：`event` 允许从 `from` 中任一状态进入 `to`
pub struct Rule<S: 'static, E> {
    pub event: E,
    pub from: &'static [S],
    pub to: S,
}

type Observer<S, E> = Box<dyn Fn(&Transition<S, E>) + Send + Sync>;

pub struct StateMachine<S: 'static, E: 'static> {
    current: S,
    rules: &'static [Rule<S, E>],
    observers: Vec<Observer<S, E>>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + PartialEq + Debug,
    E: Copy + PartialEq + Debug,
{
    pub fn new(initial: S, rules: &'static [Rule<S, E>]) -> Self {
        Self {
            current: initial,
            rules,
            observers: Vec::new(),
        }
    }

    /// 注册观察者，每次迁移生效后回调
    pub fn observe(&mut self, observer: impl Fn(&Transition<S, E>) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn is(&self, state: S) -> bool {
        self.current == state
    }

    /// 当前状态下事件是否可触发
    pub fn can(&self, event: E) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.event == event && rule.from.contains(&self.current))
    }

    /// 触发事件。迁移非法时状态保持不变
    pub fn handle(&mut self, event: E) -> Result<Transition<S, E>, FsmError<S, E>> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.event == event && rule.from.contains(&self.current))
            .ok_or(FsmError {
                event,
                from: self.current,
            })?;

        let transition = Transition {
            event,
            from: self.current,
            to: rule.to,
        };
        self.current = rule.to;

        for observer in &self.observers {
            observer(&transition);
        }
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Idle,
        Busy,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Start,
        Finish,
    }

    const RULES: &[Rule<State, Event>] = &[
        Rule {
            event: Event::Start,
            from: &[State::Idle],
            to: State::Busy,
        },
        Rule {
            event: Event::Finish,
            from: &[State::Busy],
            to: State::Done,
        },
    ];

    #[test]
    fn test_transition() {
        let mut sm = StateMachine::new(State::Idle, RULES);
        assert!(sm.can(Event::Start));
        assert!(!sm.can(Event::Finish));

        let t = sm.handle(Event::Start).unwrap();
        assert_eq!(t.from, State::Idle);
        assert_eq!(t.to, State::Busy);
        assert!(sm.is(State::Busy));
    }

    #[test]
    fn test_rejected() {
        let mut sm = StateMachine::new(State::Idle, RULES);
        let err = sm.handle(Event::Finish).unwrap_err();
        assert_eq!(err.from, State::Idle);
        // 非法迁移不改变状态
        assert!(sm.is(State::Idle));
    }

    #[test]
    fn test_observer() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut sm = StateMachine::new(State::Idle, RULES);
        let c = count.clone();
        sm.observe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sm.handle(Event::Start).unwrap();
        sm.handle(Event::Finish).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // 终态之后不再有合法迁移
        assert!(sm.handle(Event::Start).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
