use crate::models::Variant;
use sha2::{Digest, Sha256};

pub const BUCKET_COUNT: u32 = 100;

/// Stable bucket in `[0, 100)` for a session within one experiment.
///
/// The leading 32 bits of `sha256("{session}:{experiment}")`, read big-endian, modulo 100.
pub fn bucket_for(session_id: &str, experiment_id: &str) -> u32 {
    let digest = Sha256::digest(format!("{}:{}", session_id, experiment_id).as_bytes());
    let leading = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    leading % BUCKET_COUNT
}

/// Walks variants in declared order, accumulating weights until the bucket is covered.
///
/// Falls back to the first variant when the weights do not reach the bucket.
pub fn assign_variant<'a>(session_id: &str, experiment_id: &str, variants: &'a [Variant]) -> Option<&'a Variant> {
    let bucket = bucket_for(session_id, experiment_id);
    let mut cumulative = 0u32;
    for variant in variants {
        cumulative = cumulative.saturating_add(variant.weight);
        if bucket < cumulative {
            return Some(variant);
        }
    }
    variants.first()
}

pub fn assign_variant_name<'a>(session_id: &str, experiment_id: &str, variants: &'a [Variant]) -> &'a str {
    assign_variant(session_id, experiment_id, variants)
        .map(|variant| variant.name.as_str())
        .unwrap_or("control")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PromptMutation;

    fn variant(name: &str, weight: u32) -> Variant {
        Variant {
            id: format!("id-{}", name),
            experiment_id: "exp-1".to_string(),
            name: name.to_string(),
            description: None,
            weight,
            mutation: PromptMutation::noop(),
        }
    }

    #[test]
    fn assignment_is_deterministic() {
        let variants = vec![variant("control", 50), variant("direct_opener", 50)];
        for index in 0..200 {
            let session = format!("session-{}", index);
            let first = assign_variant_name(&session, "exp-1", &variants);
            let second = assign_variant_name(&session, "exp-1", &variants);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn even_split_stays_within_five_points() {
        let variants = vec![variant("control", 50), variant("treatment", 50)];
        let total = 10_000;
        let control = (0..total)
            .filter(|index| assign_variant_name(&format!("visitor-{}", index), "exp-1", &variants) == "control")
            .count();
        let share = control as f64 / total as f64;
        assert!((share - 0.5).abs() < 0.05, "control share {share}");
    }

    #[test]
    fn buckets_cover_expected_range() {
        for index in 0..1000 {
            assert!(bucket_for(&format!("s{}", index), "exp") < BUCKET_COUNT);
        }
    }

    #[test]
    fn under_weighted_experiment_falls_back_to_first_variant() {
        let variants = vec![variant("control", 0), variant("treatment", 0)];
        assert_eq!(assign_variant_name("anyone", "exp-1", &variants), "control");
        assert_eq!(assign_variant_name("anyone", "exp-1", &[]), "control");
    }

    #[test]
    fn full_weight_on_one_arm_always_selects_it() {
        let variants = vec![variant("control", 0), variant("treatment", 100)];
        for index in 0..100 {
            assert_eq!(assign_variant_name(&format!("s{}", index), "exp-1", &variants), "treatment");
        }
    }
}
