use leo_tensor::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Episode mode. Only `MetaTrain` is allowed to mutate meta-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    MetaTrain,
    MetaVal,
    MetaTest,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::MetaTrain => "meta_train",
            Mode::MetaVal => "meta_val",
            Mode::MetaTest => "meta_test",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meta_train" => Ok(Mode::MetaTrain),
            "meta_val" => Ok(Mode::MetaVal),
            "meta_test" => Ok(Mode::MetaTest),
            _ => Err(TensorError::InvalidValue { label: "mode" }),
        }
    }
}

/// One few-shot segmentation task: a support set for adaptation and a
/// held-out set for evaluation, both labelled with the task's class.
///
/// Images are `batch x (channels*h*w)`, masks `batch x (h*w)` with
/// integer-valued labels. Owned by the driver; the core only reads it.
#[derive(Debug, Clone)]
pub struct Task {
    train_images: Tensor,
    train_masks: Tensor,
    val_images: Tensor,
    val_masks: Tensor,
    class_label: String,
}

impl Task {
    pub fn new(
        train_images: Tensor,
        train_masks: Tensor,
        val_images: Tensor,
        val_masks: Tensor,
        class_label: impl Into<String>,
    ) -> PureResult<Self> {
        for (images, masks) in [(&train_images, &train_masks), (&val_images, &val_masks)] {
            if images.shape().0 != masks.shape().0 {
                return Err(TensorError::ShapeMismatch {
                    left: images.shape(),
                    right: masks.shape(),
                });
            }
            if images.shape().1 % masks.shape().1 != 0 {
                return Err(TensorError::ShapeMismatch {
                    left: images.shape(),
                    right: masks.shape(),
                });
            }
        }
        Ok(Self {
            train_images,
            train_masks,
            val_images,
            val_masks,
            class_label: class_label.into(),
        })
    }

    pub fn train_images(&self) -> &Tensor {
        &self.train_images
    }

    pub fn train_masks(&self) -> &Tensor {
        &self.train_masks
    }

    pub fn val_images(&self) -> &Tensor {
        &self.val_images
    }

    pub fn val_masks(&self) -> &Tensor {
        &self.val_masks
    }

    pub fn class_label(&self) -> &str {
        &self.class_label
    }
}

/// One meta-batch of tasks processed together under a single mode.
#[derive(Debug, Clone)]
pub struct Episode {
    index: u64,
    mode: Mode,
    tasks: Vec<Task>,
}

impl Episode {
    pub fn new(index: u64, mode: Mode, tasks: Vec<Task>) -> PureResult<Self> {
        if tasks.is_empty() {
            return Err(TensorError::EmptyInput("episode_tasks"));
        }
        Ok(Self { index, mode, tasks })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_roundtrips_through_strings() {
        for mode in [Mode::MetaTrain, Mode::MetaVal, Mode::MetaTest] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("meta_unknown".parse::<Mode>().is_err());
    }

    #[test]
    fn task_rejects_batch_mismatch() {
        let images = Tensor::zeros(2, 16).unwrap();
        let masks = Tensor::zeros(3, 16).unwrap();
        assert!(Task::new(images.clone(), masks, images.clone(), Tensor::zeros(2, 16).unwrap(), "cat").is_err());
    }

    #[test]
    fn episode_rejects_empty_task_list() {
        assert!(Episode::new(1, Mode::MetaTrain, Vec::new()).is_err());
    }
}
