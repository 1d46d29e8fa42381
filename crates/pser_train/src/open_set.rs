//! OpenMax on top of a trained supervised runner.

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array2, Axis};

use crate::error::{Result, TrainError};
use crate::runner::class_indices;
use crate::supervised::SupervisedRunner;
use pser_analysis::{analyze_classification, ClassificationReport};
use pser_core::{OpenMaxConfig, PatternModel, Task};
use pser_data::{BatchSource, Targets};
use pser_openmax::{
    activation_features, build_weibull_model, get_scores, ChannelLayout, ClassIndexMap, OpenMaxScores,
    OpenSetIndexMap, WeibullModel,
};

/// Activation features of a whole pass, with the raw class labels.
pub struct ActivationSet {
    /// `(N, layout.width())`.
    pub features: Array2<f32>,
    /// Channel layout shared by every batch.
    pub layout: ChannelLayout,
    /// Class label of each sample. May exceed the model's classes for open-set data.
    pub labels: Vec<usize>,
}

/// Result of [`SupervisedRunner::openmax`].
pub struct OpenMaxRun {
    /// OpenMax and softmax distributions.
    pub scores: OpenMaxScores,
    /// True labels with every label outside the known classes mapped to `num_classes`.
    pub labels: Vec<usize>,
    /// Known classes of the model.
    pub num_classes: usize,
}

impl OpenMaxRun {
    /// `"0"`, `"1"`, ..., `"unknown"`.
    pub fn class_names(&self) -> Vec<String> {
        (0..self.num_classes)
            .map(|c| c.to_string())
            .chain(std::iter::once("unknown".to_string()))
            .collect()
    }

    /// Report of the OpenMax predictions against the open-set labels.
    pub fn openmax_report(&self) -> Result<ClassificationReport> {
        Ok(analyze_classification(&self.scores.openmax_predictions(), &self.labels, &self.class_names())?)
    }

    /// Report of the plain softmax predictions, which never predict unknown.
    pub fn softmax_report(&self) -> Result<ClassificationReport> {
        Ok(analyze_classification(&self.scores.softmax_predictions(), &self.labels, &self.class_names())?)
    }
}

impl<B, M, O> SupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: PatternModel<B> + AutodiffModule<B>,
    M::InnerModule: PatternModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Activation features of every sample of `source`, on the inference model.
    pub fn collect_features(&self, source: &dyn BatchSource) -> Result<ActivationSet> {
        if self.settings.task != Task::Classification {
            return Err(TrainError::Other(format!("OpenMax needs a classification run, not {}", self.settings.task)));
        }
        let model = self.model.valid();
        let device: <B::InnerBackend as Backend>::Device = self.device.clone().into();
        let mut parts = Vec::new();
        let mut layout: Option<ChannelLayout> = None;
        let mut labels = Vec::new();

        for batch in source.batches() {
            let batch = batch?;
            let Targets::Labels(y) = &batch.targets else {
                return Err(TrainError::Other("OpenMax needs label targets".into()));
            };
            if batch.is_empty() {
                continue;
            }
            let x = batch.x_tensor(&device);
            let output = model.forward(x, batch.padding_tensor(&device));
            let (features, batch_layout) = activation_features(&output)?;
            match &layout {
                Some(l) if *l != batch_layout => {
                    return Err(TrainError::ForwardError("activation layout changed between batches".into()));
                }
                Some(_) => {}
                None => layout = Some(batch_layout),
            }
            parts.push(features);
            labels.extend(class_indices(y, None)?);
        }

        let layout = layout.ok_or(pser_data::DataError::EmptyDataset)?;
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let features = ndarray::concatenate(Axis(0), &views).map_err(|e| TrainError::Other(e.to_string()))?;
        Ok(ActivationSet { features, layout, labels })
    }

    /// Fit per-class Weibull tail models on the correctly classified samples of `source`.
    pub fn make_weibull_from_trainsets(&self, source: &dyn BatchSource, config: &OpenMaxConfig) -> Result<WeibullModel> {
        let set = self.collect_features(source)?;
        let model = build_weibull_model(set.features.view(), &set.labels, &set.layout, config)?;
        for failure in model.failures() {
            tracing::warn!(class = failure.class, channel = ?failure.channel, "Weibull fit failed: {}", failure.reason);
        }
        Ok(model)
    }

    /// OpenMax and softmax scores of every sample of `source`.
    pub fn openmax(&self, source: &dyn BatchSource, weibull: &WeibullModel, config: &OpenMaxConfig) -> Result<OpenMaxRun> {
        let set = self.collect_features(source)?;
        if set.layout != weibull.layout {
            return Err(TrainError::Other("activation layout differs from the Weibull model's".into()));
        }
        let num_classes = set.layout.num_classes();
        let classes = ClassIndexMap::identity(num_classes);
        let open_set = OpenSetIndexMap::unknown_last(&classes);
        let scores = get_scores(weibull, set.features.view(), num_classes, &classes, &open_set, config)?;
        let labels = set.labels.iter().map(|&l| l.min(num_classes)).collect();
        Ok(OpenMaxRun {
            scores,
            labels,
            num_classes,
        })
    }
}
