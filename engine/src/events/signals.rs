use lane_replay_common::config::EventConfig;
use lane_replay_common::detection::{Entity, EntityKind, NormalizedPoint};

/// Per-frame-set facts the state machine debounces on, read off the
/// detected entities and the lane geometry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signals {
    /// Confidence of a bowler standing on the approach.
    pub bowler: Option<f32>,
    /// Confidence of a free-rolling ball short of the pin deck.
    pub released: Option<f32>,
    /// Confidence of a ball on the pin deck.
    pub on_deck: Option<f32>,
    /// Pins seen above the pin confidence threshold.
    pub pins: Vec<NormalizedPoint>,
    /// Mean confidence of `pins`.
    pub pin_confidence: Option<f32>,
}

impl Signals {
    pub fn from_entities(entities: &[Entity], config: &EventConfig) -> Self {
        let mut signals = Signals::default();
        let mut pin_conf_sum = 0.0;
        for entity in entities {
            let y = entity.position.y;
            let conf = entity.confidence;
            match entity.kind {
                EntityKind::Bowler if conf >= config.bowler_confidence && y < config.foul_line_y => {
                    keep_max(&mut signals.bowler, conf);
                }
                EntityKind::Ball if y >= config.pin_deck_y => {
                    if conf >= config.ball_confidence {
                        keep_max(&mut signals.on_deck, conf);
                    }
                }
                EntityKind::Ball if conf >= config.release_confidence => {
                    keep_max(&mut signals.released, conf);
                }
                EntityKind::Pin if conf >= config.pin_confidence => {
                    signals.pins.push(entity.position);
                    pin_conf_sum += conf;
                }
                _ => {}
            }
        }
        if !signals.pins.is_empty() {
            signals.pin_confidence = Some(pin_conf_sum / signals.pins.len() as f32);
        }
        signals
    }
}

fn keep_max(slot: &mut Option<f32>, conf: f32) {
    *slot = Some(slot.map_or(conf, |c| c.max(conf)));
}

/// Whether the pin configuration changed between two frame sets: a pin
/// appeared or vanished, or one moved further than `epsilon`.
pub fn pins_moved(previous: &[NormalizedPoint], current: &[NormalizedPoint], epsilon: f32) -> bool {
    if previous.len() != current.len() {
        return true;
    }
    current.iter().any(|pin| {
        previous
            .iter()
            .map(|p| p.distance(pin))
            .fold(f32::INFINITY, f32::min)
            > epsilon
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_entities_by_lane_region() {
        let config = EventConfig::default();
        let signals = Signals::from_entities(
            &[
                Entity::new(EntityKind::Bowler, 0.5, 0.1, 0.6),
                Entity::new(EntityKind::Bowler, 0.5, 0.1, 0.9),
                Entity::new(EntityKind::Ball, 0.5, 0.5, 0.8),
                Entity::new(EntityKind::Pin, 0.5, 0.95, 0.9),
                Entity::new(EntityKind::Pin, 0.55, 0.96, 0.2),
            ],
            &config,
        );
        assert_eq!(signals.bowler, Some(0.9));
        assert_eq!(signals.released, Some(0.8));
        assert_eq!(signals.on_deck, None);
        assert_eq!(signals.pins.len(), 1);
        assert_eq!(signals.pin_confidence, Some(0.9));
    }

    #[test]
    fn low_confidence_and_out_of_region_are_ignored() {
        let config = EventConfig::default();
        let signals = Signals::from_entities(
            &[
                // past the foul line: not on the approach
                Entity::new(EntityKind::Bowler, 0.5, 0.4, 0.9),
                Entity::new(EntityKind::Ball, 0.5, 0.5, 0.6),
                Entity::new(EntityKind::BallInHand, 0.5, 0.2, 0.99),
                Entity::new(EntityKind::Ball, 0.5, 0.95, 0.9),
            ],
            &config,
        );
        assert_eq!(signals.bowler, None);
        assert_eq!(signals.released, None);
        assert_eq!(signals.on_deck, Some(0.9));
    }

    #[test]
    fn pin_motion_detects_moves_and_count_changes() {
        let standing = [NormalizedPoint::new(0.5, 0.95), NormalizedPoint::new(0.45, 0.97)];
        let jiggled = [NormalizedPoint::new(0.5, 0.95), NormalizedPoint::new(0.451, 0.97)];
        let toppled = [NormalizedPoint::new(0.5, 0.95), NormalizedPoint::new(0.40, 0.99)];
        assert!(!pins_moved(&standing, &jiggled, 0.01));
        assert!(pins_moved(&standing, &toppled, 0.01));
        assert!(pins_moved(&standing, &standing[..1], 0.01));
        assert!(!pins_moved(&[], &[], 0.01));
    }
}
