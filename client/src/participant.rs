use crate::leader::LeaderDriver;
use crate::mirror::SessionMirror;
use crate::network::{RelayClient, KEEPALIVE_INTERVAL};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::clock::POLL_INTERVAL;
use shared::protocol::{
    GameOverPayload, ReflectionMissingPayload, ReflectionPayload, RegisterPayload,
};
use shared::{now_ms, ClientMessage, GameConfig, ServerMessage, TimerEvent};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// How a participant identifies itself and behaves
#[derive(Debug, Clone)]
pub struct ParticipantOptions {
    pub player_id: String,
    pub role: String,
    /// Submit a reflection as soon as each round starts
    pub auto_reflect: bool,
    /// Delay between the leader's moves
    pub move_interval: Duration,
}

impl ParticipantOptions {
    /// Options for a participant that never reflects and moves every five
    /// seconds when leading
    pub fn new(player_id: &str, role: &str) -> Self {
        Self {
            player_id: player_id.to_owned(),
            role: role.to_owned(),
            auto_reflect: false,
            move_interval: Duration::from_secs(5),
        }
    }
}

/// One headless participant: the leader when its role is the configured
/// leader role, a team member otherwise.
pub struct Participant {
    client: RelayClient,
    options: ParticipantOptions,
    mirror: SessionMirror,
    leader: Option<LeaderDriver>,
    reflected: BTreeSet<u32>,
    reported_missing: BTreeSet<u32>,
}

impl Participant {
    /// Wraps a connected client.
    ///
    /// The participant leads when `options.role` is the configured leader
    /// role. Only then does it own a [`LeaderDriver`], which authors the
    /// state everyone else mirrors.
    pub fn new(client: RelayClient, config: GameConfig, options: ParticipantOptions) -> Self {
        let leader = config
            .is_leader_role(&options.role)
            .then(|| LeaderDriver::new(&options.player_id, config, StdRng::from_entropy()));

        Self {
            client,
            options,
            mirror: SessionMirror::new(),
            leader,
            reflected: BTreeSet::new(),
            reported_missing: BTreeSet::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_some()
    }

    /// Local view of the session as last relayed
    pub fn mirror(&self) -> &SessionMirror {
        &self.mirror
    }

    /// Registers, starts the session when leading, then follows it to the end.
    ///
    /// Returns when the session ends, is reset, or the relay closes the
    /// connection.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.client
            .send(&ClientMessage::Register(RegisterPayload {
                player_id: self.options.player_id.clone(),
                role: self.options.role.clone(),
            }))
            .await?;
        info!(
            "[{}] Registered as {} ({})",
            self.client.session_id(),
            self.options.player_id,
            self.options.role
        );

        if let Some(leader) = &mut self.leader {
            let state = leader.start(now_ms());
            let start = leader.session_start(&self.options.role, state.clone());
            self.client.send(&start).await?;
            let roles = [(self.options.role.clone(), self.options.player_id.clone())].into();
            self.mirror.replace(state, roles);
            self.round_started(1).await?;
        }

        let mut poll = interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        let mut steps = interval(self.options.move_interval);
        // Both fire immediately; skip that first tick.
        keepalive.tick().await;
        steps.tick().await;

        loop {
            tokio::select! {
                message = self.client.next_message() => {
                    match message? {
                        Some(message) => {
                            if !self.on_message(message).await? {
                                break;
                            }
                        }
                        None => {
                            info!("Relay closed the connection");
                            break;
                        }
                    }
                }
                _ = poll.tick() => {
                    if self.on_poll(now_ms()).await? {
                        break;
                    }
                }
                _ = steps.tick(), if self.leader.is_some() => {
                    self.take_step().await?;
                }
                _ = keepalive.tick() => {
                    self.client.send_keepalive().await?;
                }
            }
        }

        Ok(())
    }

    /// Returns false once the session has been reset
    async fn on_message(&mut self, message: ServerMessage) -> Result<bool, Box<dyn std::error::Error>> {
        let newly_started =
            matches!(message, ServerMessage::SessionStarted { .. }) && !self.mirror.started;
        self.mirror.apply(&message);

        match &message {
            ServerMessage::SessionStarted { .. } => {
                info!(
                    "[{}] Session started, round {}",
                    self.client.session_id(),
                    self.mirror.round_num().unwrap_or(1)
                );
                if newly_started {
                    let round = self.mirror.timer().map(|t| t.round_num()).unwrap_or(1);
                    self.round_started(round).await?;
                }
            }
            ServerMessage::ReflectionPenalty {
                item_code,
                reason,
                inventory,
            } => {
                warn!(
                    "[{}] {} Lost: {}",
                    self.client.session_id(),
                    reason,
                    item_code.as_deref().unwrap_or("nothing")
                );
                if let Some(leader) = &mut self.leader {
                    leader.apply_penalty(inventory);
                }
            }
            ServerMessage::Hello { from } => info!("Hello from {}", from),
            ServerMessage::ShowAlert { message } => info!("Alert: {}", message),
            ServerMessage::Log { player_id, msg } => info!("{}: {}", player_id, msg),
            ServerMessage::SessionReset {} => {
                info!("[{}] Session was reset", self.client.session_id());
                return Ok(false);
            }
            _ => {}
        }
        Ok(true)
    }

    /// Returns true once the session has ended
    async fn on_poll(&mut self, now: u64) -> Result<bool, Box<dyn std::error::Error>> {
        let events = match self.mirror.timer_mut() {
            Some(timer) => timer.poll(now),
            None => return Ok(false),
        };

        for event in events {
            match event {
                TimerEvent::RoundEnded(round) => {
                    info!("[{}] Round {} ended", self.client.session_id(), round);
                    self.report_if_missing(round).await?;
                    if let Some(leader) = &mut self.leader {
                        let update = leader.advance_round(round + 1);
                        self.client.send(&update).await?;
                    }
                    self.round_started(round + 1).await?;
                }
                TimerEvent::SessionEnded { last_round } => {
                    info!("[{}] Session ended", self.client.session_id());
                    self.report_if_missing(last_round).await?;
                    if self.leader.is_some() {
                        self.client
                            .send(&ClientMessage::GameOver(GameOverPayload {
                                reason: "Session time elapsed".into(),
                            }))
                            .await?;
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn round_started(&mut self, round: u32) -> Result<(), Box<dyn std::error::Error>> {
        if self.options.auto_reflect {
            self.submit_reflection(round, &format!("Round {} notes", round))
                .await?;
        }
        Ok(())
    }

    /// Sends a reflection for `round`, at most once per round.
    ///
    /// A round with a submitted reflection is never reported missing by
    /// this participant.
    pub async fn submit_reflection(
        &mut self,
        round: u32,
        text: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !self.reflected.insert(round) {
            return Ok(());
        }
        self.client
            .send(&ClientMessage::Reflection(ReflectionPayload {
                player_id: self.options.player_id.clone(),
                round_num: round,
                text: text.to_owned(),
            }))
            .await
    }

    /// Reports `round` as missed at most once, unless a reflection went out
    async fn report_if_missing(&mut self, round: u32) -> Result<(), Box<dyn std::error::Error>> {
        if self.reflected.contains(&round) || !self.reported_missing.insert(round) {
            return Ok(());
        }
        info!(
            "[{}] No reflection for round {}, reporting it missing",
            self.client.session_id(),
            round
        );
        self.client
            .send(&ClientMessage::ReflectionMissing(ReflectionMissingPayload {
                player_id: self.options.player_id.clone(),
                round_num: Some(round),
                text: String::new(),
            }))
            .await
    }

    async fn take_step(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let finished = self.mirror.timer().map_or(true, |t| t.is_finished());
        let Some(leader) = &mut self.leader else {
            return Ok(());
        };
        if finished {
            return Ok(());
        }
        for message in leader.next_move() {
            self.client.send(&message).await?;
        }
        Ok(())
    }
}
