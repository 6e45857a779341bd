//! Stage kind enumeration with declared capabilities.
//!
//! Policy that used to depend on which concrete stage the orchestrator was
//! looking at (default on/off, whether a persisted "on" is honoured) is
//! declared here per kind.

use serde::{Deserialize, Serialize};

/// Kinds of stages the default factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    // Sources
    CameraSource,
    FileSource,

    // Face analysis
    FaceDetector,
    FaceMarker,
    FaceAligner,

    // Face synthesis
    FaceAnimator,
    FaceSwapper,
    FrameAdjuster,
    FaceMerger,

    // Sink
    StreamOutput,
}

impl StageKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::CameraSource => "Camera Source",
            StageKind::FileSource => "File Source",
            StageKind::FaceDetector => "Face Detector",
            StageKind::FaceMarker => "Face Marker",
            StageKind::FaceAligner => "Face Aligner",
            StageKind::FaceAnimator => "Face Animator",
            StageKind::FaceSwapper => "Face Swapper",
            StageKind::FrameAdjuster => "Frame Adjuster",
            StageKind::FaceMerger => "Face Merger",
            StageKind::StreamOutput => "Stream Output",
        }
    }

    /// Stable lowercase name, used for state keys and log lines.
    pub fn key(&self) -> &'static str {
        match self {
            StageKind::CameraSource => "camera_source",
            StageKind::FileSource => "file_source",
            StageKind::FaceDetector => "face_detector",
            StageKind::FaceMarker => "face_marker",
            StageKind::FaceAligner => "face_aligner",
            StageKind::FaceAnimator => "face_animator",
            StageKind::FaceSwapper => "face_swapper",
            StageKind::FrameAdjuster => "frame_adjuster",
            StageKind::FaceMerger => "face_merger",
            StageKind::StreamOutput => "stream_output",
        }
    }

    pub fn all() -> &'static [StageKind] {
        &[
            StageKind::CameraSource,
            StageKind::FileSource,
            StageKind::FaceDetector,
            StageKind::FaceMarker,
            StageKind::FaceAligner,
            StageKind::FaceAnimator,
            StageKind::FaceSwapper,
            StageKind::FrameAdjuster,
            StageKind::FaceMerger,
            StageKind::StreamOutput,
        ]
    }

    pub fn is_source(&self) -> bool {
        matches!(self, StageKind::CameraSource | StageKind::FileSource)
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, StageKind::StreamOutput)
    }

    /// Whether a stage of this kind starts "on" when nothing was persisted.
    ///
    /// Camera access and the animator's heavy model stay off until asked for.
    pub fn default_enabled(&self) -> bool {
        !matches!(self, StageKind::CameraSource | StageKind::FaceAnimator)
    }

    /// Whether a persisted "on" is honoured on restore.
    ///
    /// A camera never switches itself on at startup, whatever was saved.
    pub fn remembers_on_state(&self) -> bool {
        !matches!(self, StageKind::CameraSource)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageKind::CameraSource => {
                "Captures frames from a camera device.\n\
                 Paced by target FPS, replays last frame on reemit."
            }
            StageKind::FileSource => {
                "Reads frames from an image sequence or video file.\n\
                 Loops back to the first frame at the end."
            }
            StageKind::FaceDetector => {
                "Finds face rectangles in each frame.\n\
                 Threshold, face limit and sort order are tunable."
            }
            StageKind::FaceMarker => {
                "Places facial landmarks and estimates head pose\n\
                 for every detected face."
            }
            StageKind::FaceAligner => {
                "Crops each face into an aligned square image\n\
                 plus a matching mask."
            }
            StageKind::FaceAnimator => {
                "Drives a still source face with the motion of\n\
                 the selected live face."
            }
            StageKind::FaceSwapper => {
                "Replaces the selected aligned face using a\n\
                 swap model."
            }
            StageKind::FrameAdjuster => {
                "Post-processes swapped faces (blur, degrade)\n\
                 before merging."
            }
            StageKind::FaceMerger => {
                "Pastes swapped faces back into the frame with\n\
                 offset, mask and opacity controls."
            }
            StageKind::StreamOutput => {
                "Shows the chosen image in a preview and can\n\
                 save it as a numbered file sequence."
            }
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
