//! Combines the pre-freeze and freeze classifier outputs into one decision.

use crate::classifier::{ClassifierError, ClassifierStage, LabelMap};
use crate::feature_extractor::CycleFeatures;
use crate::types::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFogLabel {
    NoEvent,
    EarlyWarning,
    Other(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FogLabel {
    NoEvent,
    Freeze,
    Other(i64),
}

impl PreFogLabel {
    pub fn from_class(class: i64, map: LabelMap) -> Self {
        match class {
            c if c == map.no_event => PreFogLabel::NoEvent,
            c if c == map.event => PreFogLabel::EarlyWarning,
            c => PreFogLabel::Other(c),
        }
    }
}

impl FogLabel {
    pub fn from_class(class: i64, map: LabelMap) -> Self {
        match class {
            c if c == map.no_event => FogLabel::NoEvent,
            c if c == map.event => FogLabel::Freeze,
            c => FogLabel::Other(c),
        }
    }
}

/// Freeze wins over everything; an early warning only counts while the freeze
/// classifier sees nothing. Unknown labels fall back to walking.
pub fn fuse(pre_fog: PreFogLabel, fog: FogLabel) -> Decision {
    match (pre_fog, fog) {
        (_, FogLabel::Freeze) => Decision::Fog,
        (PreFogLabel::EarlyWarning, FogLabel::NoEvent) => Decision::PreFog,
        _ => Decision::Walk,
    }
}

/// Labels behind the last fused decision, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionOutcome {
    pub pre_fog: PreFogLabel,
    pub fog: FogLabel,
    pub decision: Decision,
}

pub struct ClassifierFusion {
    pre_fog: Option<ClassifierStage>,
    fog: ClassifierStage,
}

impl ClassifierFusion {
    /// Without a pre-freeze stage the pipeline only distinguishes walking and freezing.
    pub fn new(pre_fog: Option<ClassifierStage>, fog: ClassifierStage) -> Self {
        Self { pre_fog, fog }
    }

    /// Runs both stages on precomputed feature vectors
    pub fn classify(
        &mut self,
        pre_fog_features: &[f64],
        fog_features: &[f64],
    ) -> Result<FusionOutcome, ClassifierError> {
        let pre_fog = match self.pre_fog.as_mut() {
            Some(stage) => {
                let class = stage.predict(pre_fog_features)?;
                PreFogLabel::from_class(class, stage.labels())
            }
            None => PreFogLabel::NoEvent,
        };
        let fog = FogLabel::from_class(self.fog.predict(fog_features)?, self.fog.labels());

        Ok(FusionOutcome {
            pre_fog,
            fog,
            decision: fuse(pre_fog, fog),
        })
    }

    /// Extracts each stage's schema from the cycle and classifies
    pub fn classify_cycle(
        &mut self,
        cycle: &mut CycleFeatures<'_, '_>,
    ) -> Result<FusionOutcome, ClassifierError> {
        let pre_fog = match self.pre_fog.as_ref() {
            Some(stage) => cycle.extract(stage.schema()).into_vec(),
            None => Vec::new(),
        };
        let fog = cycle.extract(self.fog.schema());
        self.classify(&pre_fog, fog.as_slice())
    }

    pub fn has_pre_fog(&self) -> bool {
        self.pre_fog.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classifier::{Classifier, IdentityScaler};
    use crate::schema::{ChannelLayout, FeatureSchema, FeatureSpec};

    /// Always answers the same class
    pub(crate) struct FixedClassifier(pub i64);

    impl Classifier for FixedClassifier {
        fn predict(&mut self, _features: &[f64]) -> Result<i64, ClassifierError> {
            Ok(self.0)
        }
    }

    pub(crate) fn fixed_stage(name: &str, schema: FeatureSchema, class: i64, labels: LabelMap) -> ClassifierStage {
        ClassifierStage::new(
            name,
            schema,
            Box::new(IdentityScaler),
            Box::new(FixedClassifier(class)),
            labels,
        )
        .unwrap()
    }

    fn one_feature() -> FeatureSchema {
        let layout = ChannelLayout::single_imu();
        FeatureSchema::compile(&[FeatureSpec::Max { channel: "ax".into() }], &layout).unwrap()
    }

    #[test]
    fn truth_table() {
        use FogLabel as F;
        use PreFogLabel as P;

        assert_eq!(fuse(P::NoEvent, F::NoEvent), Decision::Walk);
        assert_eq!(fuse(P::EarlyWarning, F::NoEvent), Decision::PreFog);
        assert_eq!(fuse(P::NoEvent, F::Freeze), Decision::Fog);
        assert_eq!(fuse(P::EarlyWarning, F::Freeze), Decision::Fog);
        assert_eq!(fuse(P::Other(1), F::Freeze), Decision::Fog);
        assert_eq!(fuse(P::Other(1), F::NoEvent), Decision::Walk);
        assert_eq!(fuse(P::EarlyWarning, F::Other(3)), Decision::Walk);
        assert_eq!(fuse(P::NoEvent, F::Other(3)), Decision::Walk);
    }

    #[test]
    fn class_ids_follow_label_maps() {
        assert_eq!(PreFogLabel::from_class(0, LabelMap::PRE_FOG), PreFogLabel::NoEvent);
        assert_eq!(PreFogLabel::from_class(2, LabelMap::PRE_FOG), PreFogLabel::EarlyWarning);
        assert_eq!(PreFogLabel::from_class(1, LabelMap::PRE_FOG), PreFogLabel::Other(1));
        assert_eq!(FogLabel::from_class(1, LabelMap::FOG), FogLabel::Freeze);
        assert_eq!(FogLabel::from_class(2, LabelMap::FOG), FogLabel::Other(2));
    }

    #[test]
    fn fog_takes_precedence_over_early_warning() {
        let mut fusion = ClassifierFusion::new(
            Some(fixed_stage("pre_fog", one_feature(), 2, LabelMap::PRE_FOG)),
            fixed_stage("fog", one_feature(), 1, LabelMap::FOG),
        );
        let outcome = fusion.classify(&[0.0], &[0.0]).unwrap();
        assert_eq!(outcome.pre_fog, PreFogLabel::EarlyWarning);
        assert_eq!(outcome.decision, Decision::Fog);
    }

    #[test]
    fn single_stage_deployment_never_warns() {
        let mut fusion = ClassifierFusion::new(None, fixed_stage("fog", one_feature(), 0, LabelMap::FOG));
        assert!(!fusion.has_pre_fog());
        let outcome = fusion.classify(&[], &[0.0]).unwrap();
        assert_eq!(outcome.pre_fog, PreFogLabel::NoEvent);
        assert_eq!(outcome.decision, Decision::Walk);
    }

    #[test]
    fn wrong_width_is_an_error() {
        let mut fusion = ClassifierFusion::new(None, fixed_stage("fog", one_feature(), 1, LabelMap::FOG));
        assert!(matches!(
            fusion.classify(&[], &[0.0, 1.0]),
            Err(ClassifierError::InvalidFeatureSize { expected: 1, actual: 2 })
        ));
    }
}
