//! A timer-driven counter. Its ticker runs on a dedicated context; the
//! counter finishes itself once it reaches its limit.

use std::time::Duration;

use anyhow::{bail, Result};
use feedloop_engine::stream;
use feedloop_engine::{EngineConfig, ExecutionContext, Feedback, Loop, LoopBuilder, Reducer};
use futures::StreamExt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counter {
    pub ticks: u32,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEvent {
    Tick,
    Finish,
}

pub fn reduce(state: Counter, event: CounterEvent) -> Counter {
    match event {
        CounterEvent::Tick if !state.finished => Counter {
            ticks: state.ticks + 1,
            ..state
        },
        CounterEvent::Finish => Counter {
            finished: true,
            ..state
        },
        CounterEvent::Tick => state,
    }
}

pub fn build(config: &EngineConfig, limit: u32) -> Result<Loop<Counter, CounterEvent>> {
    let period = Duration::from_millis(config.demo_tick_ms);
    let ticker = Feedback::new(move |state: Counter| {
        if state.ticks < limit {
            stream::delayed(CounterEvent::Tick, period)
        } else {
            stream::empty()
        }
    })
    .execute_on(ExecutionContext::dedicated_with(config, "ticker")?);

    let finisher = Feedback::new(move |state: Counter| {
        if state.ticks >= limit && !state.finished {
            stream::just(CounterEvent::Finish)
        } else {
            stream::empty()
        }
    });

    let counter = LoopBuilder::new(Counter::default())
        .with_feedback(ticker)
        .with_feedback(finisher)
        .with_reducer(Reducer::new(reduce, ExecutionContext::current()?))
        .build()?;
    Ok(counter)
}

/// Count to `limit` and return the final state.
pub async fn run(config: &EngineConfig, limit: u32) -> Result<Counter> {
    let counter = build(config, limit)?;
    let mut states = counter.stream();

    while let Some(state) = states.next().await {
        info!(ticks = state.ticks, "Counter");
        if state.finished {
            return Ok(state);
        }
    }
    bail!("counter stream ended before finishing")
}
