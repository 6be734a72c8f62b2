use bridge::{BridgeError, Bus, QosProfile, Reliability};
use controller::{LifecycleError, LifecycleState, NodeConfig, Transition, YoloNode};
use inference::result::{Boxes, KeypointInstance, Keypoints, Masks};
use inference::{
    Capabilities, DecodedImage, Detector, DetectorLoader, InferenceError, InferenceParams,
    ModelSpec, ModelType, RawResult,
};
use ndarray::{arr1, arr2};
use schema::{
    BoundingBox2D, DetectionArray, Header, Image, Point2D, SetBoolRequest, SetBoolResponse,
    SetClassesRequest, SetClassesResponse, Time, Vector2,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const IMAGE_TOPIC: &str = "/yolo/image_raw";
const DETECTIONS_TOPIC: &str = "/yolo/detections";
const ENABLE_SERVICE: &str = "/yolo/enable";
const SET_CLASSES_SERVICE: &str = "/yolo/set_classes";
const SPIN: Duration = Duration::from_millis(500);

#[derive(Default)]
struct LoaderLog {
    loads: usize,
    releases: usize,
    inferences: usize,
    last_params: Option<InferenceParams>,
}

#[derive(Clone)]
struct FakeLoader {
    log: Arc<Mutex<LoaderLog>>,
    result: RawResult,
    fail_with: Option<String>,
}

impl FakeLoader {
    fn new(result: RawResult) -> Self {
        Self {
            log: Arc::default(),
            result,
            fail_with: None,
        }
    }

    fn loads(&self) -> usize {
        self.log.lock().unwrap().loads
    }

    fn releases(&self) -> usize {
        self.log.lock().unwrap().releases
    }

    fn inferences(&self) -> usize {
        self.log.lock().unwrap().inferences
    }
}

struct FakeDetector {
    log: Arc<Mutex<LoaderLog>>,
    names: Vec<String>,
    result: RawResult,
    open_vocabulary: bool,
}

impl Detector for FakeDetector {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn infer(
        &mut self,
        image: &DecodedImage,
        params: &InferenceParams,
    ) -> Result<RawResult, InferenceError> {
        let mut log = self.log.lock().unwrap();
        log.inferences += 1;
        log.last_params = Some(params.clone());
        let mut result = self.result.clone();
        result.orig_shape = (image.height(), image.width());
        Ok(result)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            open_vocabulary: self.open_vocabulary,
        }
    }

    fn fuse(&mut self) -> Result<(), InferenceError> {
        Err(InferenceError::Unsupported("fuse"))
    }

    fn set_classes(&mut self, classes: &[String]) -> Result<(), InferenceError> {
        if !self.open_vocabulary {
            return Err(InferenceError::Unsupported("set_classes"));
        }
        self.names = classes.to_vec();
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().unwrap().releases += 1;
    }
}

impl DetectorLoader for FakeLoader {
    fn load(&self, spec: &ModelSpec<'_>) -> Result<Box<dyn Detector>, InferenceError> {
        if spec.model.starts_with("missing") {
            return Err(InferenceError::ModelNotFound(spec.model.to_string()));
        }
        if let Some(reason) = &self.fail_with {
            return Err(InferenceError::InvalidOutput(reason.clone()));
        }
        self.log.lock().unwrap().loads += 1;
        Ok(Box::new(FakeDetector {
            log: Arc::clone(&self.log),
            names: inference::labels::coco_labels(),
            result: self.result.clone(),
            open_vocabulary: spec.model_type == ModelType::World,
        }))
    }
}

fn person_result() -> RawResult {
    let mut raw = RawResult::empty((480, 640));
    raw.boxes = Some(Boxes {
        xywh: arr2(&[[320.0, 240.0, 100.0, 200.0]]),
        cls: arr1(&[0]),
        conf: arr1(&[0.91]),
    });
    raw
}

fn params(auto_activate: bool) -> NodeConfig {
    NodeConfig {
        auto_activate,
        ..NodeConfig::default()
    }
}

fn frame(seq: i32) -> Image {
    Image::new(
        Header::new("camera_optical", Time { sec: seq, nanosec: 500 }),
        640,
        480,
        "bgr8",
        640 * 3,
        vec![0; 640 * 480 * 3],
    )
}

struct Harness {
    bus: Bus,
    loader: FakeLoader,
    node: YoloNode<FakeLoader>,
}

impl Harness {
    fn new(result: RawResult, parameters: NodeConfig) -> Self {
        let bus = Bus::new();
        let loader = FakeLoader::new(result);
        let node = YoloNode::new(bus.clone(), loader.clone(), parameters);
        Self { bus, loader, node }
    }

    fn active(result: RawResult, parameters: NodeConfig) -> Self {
        let mut h = Self::new(result, parameters);
        h.node.configure().unwrap();
        h.node.activate().unwrap();
        h
    }

    /// Publish one frame and let the node handle it.
    fn feed(&mut self, image: Image) {
        let camera = self
            .bus
            .publisher::<Image>(IMAGE_TOPIC, QosProfile::keep_last(1))
            .unwrap();
        camera.publish(image);
        assert!(self.node.spin_once(SPIN), "frame should be handled");
    }

    fn call_enable(&mut self, data: bool) -> SetBoolResponse {
        let client = self.bus.client::<SetBoolRequest, SetBoolResponse>(ENABLE_SERVICE);
        let caller = thread::spawn(move || client.call(SetBoolRequest { data }, SPIN * 4));
        assert!(self.node.spin_once(SPIN * 4));
        caller.join().unwrap().unwrap()
    }
}

// ========== Configure / Cleanup ==========

#[test]
fn configure_then_cleanup_never_loads_model() {
    let mut h = Harness::new(person_result(), params(false));

    assert_eq!(h.node.configure().unwrap(), LifecycleState::Inactive);
    assert_eq!(h.bus.publisher_count(DETECTIONS_TOPIC), 1);

    assert_eq!(h.node.cleanup().unwrap(), LifecycleState::Unconfigured);
    assert_eq!(h.loader.loads(), 0);
    assert_eq!(h.bus.publisher_count(DETECTIONS_TOPIC), 0);
    assert!(h.node.configuration().is_none());
}

#[test]
fn annotated_publisher_exists_only_when_requested() {
    let mut h = Harness::new(
        person_result(),
        NodeConfig {
            publish_result_img: true,
            auto_activate: false,
            ..NodeConfig::default()
        },
    );
    h.node.configure().unwrap();
    assert_eq!(h.bus.publisher_count("/yolo/detections_img"), 1);

    let mut plain = Harness::new(person_result(), params(false));
    plain.node.configure().unwrap();
    assert_eq!(plain.bus.publisher_count("/yolo/detections_img"), 0);
}

#[test]
fn annotated_image_follows_image_reliability() {
    let mut h = Harness::active(
        person_result(),
        NodeConfig {
            publish_result_img: true,
            image_reliability: "best_effort".to_string(),
            ..params(false)
        },
    );
    let reliable = h
        .bus
        .subscribe::<Image>("/yolo/detections_img", QosProfile::keep_last(1))
        .unwrap();
    let best_effort = h
        .bus
        .subscribe::<Image>(
            "/yolo/detections_img",
            QosProfile::sensor_data(Reliability::BestEffort),
        )
        .unwrap();

    h.feed(frame(4));

    assert!(reliable.try_recv().is_none());
    assert_eq!(best_effort.try_recv().unwrap().header, frame(4).header);
}

#[test]
fn invalid_parameters_fail_configure_and_stay_unconfigured() {
    let mut h = Harness::new(
        person_result(),
        NodeConfig {
            threshold: 2.0,
            ..NodeConfig::default()
        },
    );

    assert!(matches!(
        h.node.configure(),
        Err(LifecycleError::Configuration(_))
    ));
    assert_eq!(h.node.state(), LifecycleState::Unconfigured);
    assert_eq!(h.bus.publisher_count(DETECTIONS_TOPIC), 0);
}

#[test]
fn parameters_are_snapshotted_at_configure() {
    let mut h = Harness::new(person_result(), params(false));
    h.node.configure().unwrap();

    let err = h.node.set_parameters(params(true)).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::ParametersLocked(LifecycleState::Inactive)
    ));

    h.node.cleanup().unwrap();
    h.node
        .set_parameters(NodeConfig {
            threshold: 0.3,
            ..params(false)
        })
        .unwrap();
    h.node.configure().unwrap();
    assert_eq!(h.node.configuration().unwrap().inference.confidence, 0.3);
}

// ========== Activate ==========

#[test]
fn missing_model_never_reaches_active() {
    let mut h = Harness::new(
        person_result(),
        NodeConfig {
            model: "missing.onnx".to_string(),
            ..params(false)
        },
    );
    h.node.configure().unwrap();

    let err = h.node.activate().unwrap_err();

    assert!(matches!(err, LifecycleError::ModelLoad { ref model, .. } if model == "missing.onnx"));
    assert_eq!(h.node.state(), LifecycleState::Inactive);
    assert!(h.node.class_names().is_none());
    assert!(!h.bus.has_service(ENABLE_SERVICE));
    assert_eq!(h.bus.subscription_count(IMAGE_TOPIC), 0);
}

#[test]
fn loader_failure_is_activation_error() {
    let bus = Bus::new();
    let mut loader = FakeLoader::new(person_result());
    loader.fail_with = Some("corrupt graph".to_string());
    let mut node = YoloNode::new(bus.clone(), loader, params(false));
    node.configure().unwrap();

    assert!(matches!(node.activate(), Err(LifecycleError::Activation(_))));
    assert_eq!(node.state(), LifecycleState::Inactive);
    assert!(!bus.has_service(ENABLE_SERVICE));
}

#[test]
fn taken_service_name_rolls_back_activation() {
    let mut h = Harness::new(person_result(), params(false));
    let squatter = h
        .bus
        .create_service::<SetBoolRequest, SetBoolResponse>(ENABLE_SERVICE)
        .unwrap();
    h.node.configure().unwrap();

    assert!(matches!(h.node.activate(), Err(LifecycleError::Activation(_))));
    assert_eq!(h.node.state(), LifecycleState::Inactive);
    assert_eq!(h.loader.releases(), 1);
    assert_eq!(h.bus.subscription_count(IMAGE_TOPIC), 0);

    drop(squatter);
    assert_eq!(h.node.activate().unwrap(), LifecycleState::Active);
}

#[test]
fn fuse_failure_does_not_block_activation() {
    // The fake detector always fails to fuse.
    let h = Harness::active(person_result(), params(false));
    assert_eq!(h.node.state(), LifecycleState::Active);
}

#[test]
fn closed_vocabulary_registers_enable_only() {
    let h = Harness::active(person_result(), params(false));

    assert!(h.bus.has_service(ENABLE_SERVICE));
    assert!(!h.bus.has_service(SET_CLASSES_SERVICE));
    assert_eq!(h.bus.subscription_count(IMAGE_TOPIC), 1);
}

#[test]
fn open_vocabulary_registers_set_classes() {
    let h = Harness::active(
        person_result(),
        NodeConfig {
            model_type: "World".to_string(),
            ..params(false)
        },
    );

    assert!(h.bus.has_service(ENABLE_SERVICE));
    assert!(h.bus.has_service(SET_CLASSES_SERVICE));
}

// ========== Frames ==========

#[test]
fn person_frame_produces_exact_detection() {
    let mut h = Harness::active(person_result(), params(false));
    let out = h
        .bus
        .subscribe::<DetectionArray>(DETECTIONS_TOPIC, QosProfile::default())
        .unwrap();

    h.feed(frame(7));

    let batch = out.try_recv().expect("one batch per frame");
    assert_eq!(batch.header, frame(7).header);
    assert_eq!(batch.detections.len(), 1);
    let d = &batch.detections[0];
    assert_eq!(d.class_id, 0);
    assert_eq!(d.class_name, "person");
    assert!((d.score - 0.91).abs() < 1e-6);
    assert_eq!(
        d.bbox,
        BoundingBox2D::AxisAligned {
            center: Point2D::new(320.0, 240.0),
            size: Vector2 { x: 100.0, y: 200.0 },
        }
    );
    assert!(d.mask.is_none());
    assert!(d.keypoints.is_none());
}

#[test]
fn detector_receives_configured_parameters() {
    let mut h = Harness::active(
        person_result(),
        NodeConfig {
            iou: 0.7,
            max_det: 50,
            agnostic_nms: true,
            device: "cuda:0".to_string(),
            ..params(false)
        },
    );

    h.feed(frame(1));

    let log = h.loader.log.lock().unwrap();
    let p = log.last_params.as_ref().unwrap();
    assert_eq!(p.iou, 0.7);
    assert_eq!(p.max_det, 50);
    assert!(p.agnostic_nms);
    assert_eq!(p.device, "cuda:0");
    assert_eq!(p.image_size, (640, 640));
}

#[test]
fn keypoints_pair_with_their_instances() {
    let mut raw = RawResult::empty((480, 640));
    raw.boxes = Some(Boxes {
        xywh: arr2(&[
            [100.0, 100.0, 20.0, 40.0],
            [200.0, 100.0, 20.0, 40.0],
            [300.0, 100.0, 20.0, 40.0],
        ]),
        cls: arr1(&[0, 0, 0]),
        conf: arr1(&[0.9, 0.8, 0.7]),
    });
    let instance = |scores: Option<[f32; 2]>| KeypointInstance {
        xy: arr2(&[[1.0, 2.0], [3.0, 4.0]]),
        conf: scores.map(|s| arr1(&s)),
    };
    raw.keypoints = Some(Keypoints {
        instances: vec![
            instance(Some([0.9, 0.4])),
            instance(None),
            instance(Some([0.6, 0.8])),
        ],
    });

    let mut h = Harness::active(raw, params(false));
    let out = h
        .bus
        .subscribe::<DetectionArray>(DETECTIONS_TOPIC, QosProfile::default())
        .unwrap();
    h.feed(frame(3));

    let batch = out.try_recv().unwrap();
    let kp: Vec<Option<usize>> = batch
        .detections
        .iter()
        .map(|d| d.keypoints.as_ref().map(|k| k.data.len()))
        .collect();
    assert_eq!(kp, vec![Some(1), None, Some(2)]);
    let third = batch.detections[2].keypoints.as_ref().unwrap();
    assert_eq!(third.data.iter().map(|k| k.id).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(batch.detections[2].bbox.center(), Point2D::new(300.0, 100.0));
}

#[test]
fn segmentation_masks_pair_with_their_instances() {
    let mut raw = RawResult::empty((480, 640));
    raw.boxes = Some(Boxes {
        xywh: arr2(&[[100.0, 100.0, 20.0, 20.0], [400.0, 300.0, 40.0, 40.0]]),
        cls: arr1(&[0, 2]),
        conf: arr1(&[0.9, 0.8]),
    });
    raw.masks = Some(Masks {
        contours: vec![
            vec![arr2(&[[90.0, 90.0], [110.0, 90.0], [110.0, 110.0]])],
            vec![arr2(&[[380.0, 280.0], [420.0, 320.0]])],
        ],
    });

    let mut h = Harness::active(raw, params(false));
    let out = h
        .bus
        .subscribe::<DetectionArray>(DETECTIONS_TOPIC, QosProfile::default())
        .unwrap();
    h.feed(frame(5));

    let batch = out.try_recv().unwrap();
    assert_eq!(batch.detections.len(), 2);

    let person = &batch.detections[0];
    let mask = person.mask.as_ref().expect("person mask");
    assert_eq!((mask.height, mask.width), (480, 640));
    assert_eq!(mask.data.len(), 3);
    assert_eq!(mask.data[0], Point2D::new(90.0, 90.0));

    let car = &batch.detections[1];
    assert_eq!(car.class_name, "car");
    let mask = car.mask.as_ref().expect("car mask");
    assert_eq!((mask.height, mask.width), (480, 640));
    assert_eq!(
        mask.data,
        vec![Point2D::new(380.0, 280.0), Point2D::new(420.0, 320.0)]
    );
}

#[test]
fn corrupt_frame_is_dropped_and_node_keeps_running() {
    let mut h = Harness::active(person_result(), params(false));
    let out = h
        .bus
        .subscribe::<DetectionArray>(DETECTIONS_TOPIC, QosProfile::default())
        .unwrap();

    let mut broken = frame(1);
    broken.encoding = "yuv422".to_string();
    h.feed(broken);
    assert!(out.try_recv().is_none());

    h.feed(frame(2));
    assert_eq!(out.try_recv().unwrap().header.stamp.sec, 2);
    assert_eq!(h.node.state(), LifecycleState::Active);
}

// ========== Services ==========

#[test]
fn disabling_stops_batches_until_reenabled() {
    let mut h = Harness::active(person_result(), params(false));
    let out = h
        .bus
        .subscribe::<DetectionArray>(DETECTIONS_TOPIC, QosProfile::default())
        .unwrap();

    assert!(h.call_enable(false).success);
    assert!(!h.node.is_enabled());
    for seq in 0..3 {
        h.feed(frame(seq));
    }
    assert!(out.try_recv().is_none());
    assert_eq!(h.loader.inferences(), 0);

    assert!(h.call_enable(true).success);
    h.feed(frame(10));
    assert_eq!(out.try_recv().unwrap().header.stamp.sec, 10);
}

#[test]
fn set_classes_service_returns_new_label_table() {
    let mut h = Harness::active(
        person_result(),
        NodeConfig {
            model_type: "World".to_string(),
            ..params(false)
        },
    );
    let client = h
        .bus
        .client::<SetClassesRequest, SetClassesResponse>(SET_CLASSES_SERVICE);
    let classes = vec!["forklift".to_string(), "pallet".to_string()];
    let request = SetClassesRequest {
        classes: classes.clone(),
    };
    let caller = thread::spawn(move || client.call(request, SPIN * 4));

    assert!(h.node.spin_once(SPIN * 4));
    let response = caller.join().unwrap().unwrap();

    assert!(response.success);
    assert_eq!(response.classes, classes);
    assert_eq!(h.node.class_names(), Some(classes));
}

#[test]
fn set_classes_unavailable_for_closed_vocabulary() {
    let mut h = Harness::active(person_result(), params(false));
    let client = h
        .bus
        .client::<SetClassesRequest, SetClassesResponse>(SET_CLASSES_SERVICE);

    let err = client
        .call(SetClassesRequest { classes: vec![] }, Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, BridgeError::ServiceUnavailable(_)));
    assert!(h.node.set_classes(&["a".to_string()]).is_err());
}

// ========== Deactivate / Reactivate ==========

#[test]
fn reactivation_loads_fresh_detector_and_forgets_classes() {
    let mut h = Harness::active(
        person_result(),
        NodeConfig {
            model_type: "World".to_string(),
            ..params(false)
        },
    );
    h.node.set_classes(&["drone".to_string()]).unwrap();
    assert_eq!(h.node.class_names(), Some(vec!["drone".to_string()]));

    for cycle in 1..=3 {
        assert_eq!(h.node.deactivate().unwrap(), LifecycleState::Inactive);
        assert!(!h.bus.has_service(ENABLE_SERVICE));
        assert!(!h.bus.has_service(SET_CLASSES_SERVICE));
        assert_eq!(h.bus.subscription_count(IMAGE_TOPIC), 0);
        assert!(h.node.class_names().is_none());
        assert_eq!(h.loader.releases(), cycle);

        assert_eq!(h.node.activate().unwrap(), LifecycleState::Active);
        assert_eq!(h.loader.loads(), cycle + 1);
        assert_eq!(h.node.class_names().unwrap()[0], "person");
    }
}

#[test]
fn frames_published_while_inactive_are_not_processed() {
    let mut h = Harness::active(person_result(), params(false));
    h.node.deactivate().unwrap();

    let camera = h
        .bus
        .publisher::<Image>(IMAGE_TOPIC, QosProfile::keep_last(1))
        .unwrap();
    assert_eq!(camera.publish(frame(1)), 0);
    assert!(!h.node.spin_once(Duration::from_millis(10)));
    assert_eq!(h.loader.inferences(), 0);
}

// ========== Auto-activation ==========

#[test]
fn auto_activate_fires_once_node_is_inactive() {
    let mut h = Harness::new(person_result(), params(true));
    assert!(!h.node.spin_once(Duration::from_millis(10)));
    assert_eq!(h.node.state(), LifecycleState::Unconfigured);

    h.node.configure().unwrap();
    assert_eq!(h.node.state(), LifecycleState::Inactive);

    assert!(h.node.spin_once(SPIN));
    assert_eq!(h.node.state(), LifecycleState::Active);
    assert_eq!(h.loader.loads(), 1);

    // Fires only once.
    h.node.deactivate().unwrap();
    h.node.spin_once(Duration::from_millis(10));
    assert_eq!(h.node.state(), LifecycleState::Inactive);
}

#[test]
fn auto_activate_failure_is_not_retried() {
    let mut h = Harness::new(
        person_result(),
        NodeConfig {
            model: "missing.onnx".to_string(),
            ..params(true)
        },
    );
    h.node.configure().unwrap();

    assert!(h.node.spin_once(SPIN));
    assert_eq!(h.node.state(), LifecycleState::Inactive);
    assert!(!h.node.spin_once(Duration::from_millis(10)));
    assert_eq!(h.node.state(), LifecycleState::Inactive);
}

#[test]
fn disabled_auto_activate_stays_inactive() {
    let mut h = Harness::new(person_result(), params(false));
    h.node.configure().unwrap();
    h.node.spin_once(Duration::from_millis(10));
    assert_eq!(h.node.state(), LifecycleState::Inactive);
}

// ========== Shutdown ==========

#[test]
fn shutdown_from_active_tears_everything_down() {
    let mut h = Harness::active(person_result(), params(false));

    assert_eq!(h.node.shutdown().unwrap(), LifecycleState::Finalized);

    assert_eq!(h.loader.releases(), 1);
    assert!(!h.bus.has_service(ENABLE_SERVICE));
    assert_eq!(h.bus.subscription_count(IMAGE_TOPIC), 0);
    assert_eq!(h.bus.publisher_count(DETECTIONS_TOPIC), 0);
    assert!(matches!(
        h.node.trigger(Transition::Configure),
        Err(LifecycleError::InvalidTransition(_))
    ));
}

#[test]
fn shutdown_from_unconfigured_is_allowed() {
    let mut h = Harness::new(person_result(), params(false));
    assert_eq!(h.node.shutdown().unwrap(), LifecycleState::Finalized);
}

#[test]
fn invalid_transition_leaves_state_unchanged() {
    let mut h = Harness::new(person_result(), params(false));

    assert!(matches!(
        h.node.activate(),
        Err(LifecycleError::InvalidTransition(_))
    ));
    assert_eq!(h.node.state(), LifecycleState::Unconfigured);
    assert_eq!(h.loader.loads(), 0);
}
