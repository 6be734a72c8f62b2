use crate::config::{ConfigError, Configuration, NodeConfig};
use crate::processor::FrameProcessor;
use crate::state_machine::{InvalidTransition, LifecycleState, StateMachine, Transition};
use bridge::{BridgeError, Bus, QosProfile, ServiceRequest, ServiceServer, Subscription, names};
use crossbeam_channel::Select;
use inference::{Detector, DetectorLoader, InferenceError, ModelSpec, is_cuda_device};
use schema::{
    DetectionArray, Image, SetBoolRequest, SetBoolResponse, SetClassesRequest, SetClassesResponse,
};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] BridgeError),

    #[error("Failed to load model '{model}': {source}")]
    ModelLoad {
        model: String,
        #[source]
        source: InferenceError,
    },

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Parameters can only be changed while unconfigured (node is {0})")]
    ParametersLocked(LifecycleState),

    #[error("Detector error: {0}")]
    Detector(#[from] InferenceError),

    #[error("Node is not active")]
    NotActive,
}

type EnableServer = ServiceServer<SetBoolRequest, SetBoolResponse>;
type ClassesServer = ServiceServer<SetClassesRequest, SetClassesResponse>;

/// Resources created by configure and destroyed by cleanup.
struct Configured {
    config: Configuration,
    processor: FrameProcessor,
}

/// Resources that exist only while active. Field order is drop order: the
/// image subscription goes before the detector it feeds.
struct Active {
    subscription: Subscription<Image>,
    enable_srv: EnableServer,
    classes_srv: Option<ClassesServer>,
    detector: Box<dyn Detector>,
}

enum Event {
    Image(Image),
    Enable(ServiceRequest<SetBoolRequest, SetBoolResponse>),
    SetClasses(ServiceRequest<SetClassesRequest, SetClassesResponse>),
}

/// Lifecycle-managed detection node.
///
/// Every mutation (transitions, service calls, frames) runs on the thread
/// that owns the node; [`YoloNode::spin_once`] pulls one event at a time.
pub struct YoloNode<L: DetectorLoader> {
    name: String,
    bus: Bus,
    loader: L,
    parameters: NodeConfig,
    machine: StateMachine,
    configured: Option<Configured>,
    active: Option<Active>,
    auto_activate_pending: bool,
}

impl<L: DetectorLoader> YoloNode<L> {
    pub fn new(bus: Bus, loader: L, parameters: NodeConfig) -> Self {
        Self {
            name: "yolo_node".to_string(),
            bus,
            loader,
            parameters,
            machine: StateMachine::new(),
            configured: None,
            active: None,
            auto_activate_pending: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.current()
    }

    pub fn parameters(&self) -> &NodeConfig {
        &self.parameters
    }

    /// Replace declared parameters. They take effect at the next configure.
    pub fn set_parameters(&mut self, parameters: NodeConfig) -> Result<(), LifecycleError> {
        if self.state() != LifecycleState::Unconfigured {
            return Err(LifecycleError::ParametersLocked(self.state()));
        }
        self.parameters = parameters;
        Ok(())
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configured.as_ref().map(|c| &c.config)
    }

    pub fn is_enabled(&self) -> bool {
        self.configured
            .as_ref()
            .is_some_and(|c| c.processor.is_enabled())
    }

    /// Label table of the loaded detector, if any.
    pub fn class_names(&self) -> Option<Vec<String>> {
        self.active.as_ref().map(|a| a.detector.names().to_vec())
    }

    /// Fully qualified name of `name` under this node's namespace.
    pub fn resolve(&self, name: &str) -> Result<String, BridgeError> {
        names::resolve(&self.parameters.namespace, name)
    }

    pub fn configure(&mut self) -> Result<LifecycleState, LifecycleError> {
        self.trigger(Transition::Configure)
    }

    pub fn activate(&mut self) -> Result<LifecycleState, LifecycleError> {
        self.trigger(Transition::Activate)
    }

    pub fn deactivate(&mut self) -> Result<LifecycleState, LifecycleError> {
        self.trigger(Transition::Deactivate)
    }

    pub fn cleanup(&mut self) -> Result<LifecycleState, LifecycleError> {
        self.trigger(Transition::Cleanup)
    }

    pub fn shutdown(&mut self) -> Result<LifecycleState, LifecycleError> {
        self.trigger(Transition::Shutdown)
    }

    /// Run `transition`. On failure the state is left unchanged and nothing
    /// the transition created is kept.
    pub fn trigger(&mut self, transition: Transition) -> Result<LifecycleState, LifecycleError> {
        self.machine.check(transition)?;

        let result = match transition {
            Transition::Configure => self.on_configure(),
            Transition::Activate => self.on_activate(),
            Transition::Deactivate => {
                self.on_deactivate();
                Ok(())
            }
            Transition::Cleanup => {
                self.on_cleanup();
                Ok(())
            }
            Transition::Shutdown => {
                self.on_shutdown();
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(self.machine.complete(transition)?),
            Err(e) => {
                tracing::error!(
                    node = %self.name,
                    %transition,
                    state = %self.state(),
                    error = %e,
                    "Transition failed"
                );
                Err(e)
            }
        }
    }

    fn on_configure(&mut self) -> Result<(), LifecycleError> {
        tracing::info!(node = %self.name, "Configuring...");

        let config = self.parameters.validate()?;
        if is_cuda_device(config.device()) {
            tracing::info!(device = %config.device(), "CUDA device requested");
        }

        let detections = self
            .bus
            .publisher::<DetectionArray>(&self.resolve(names::DETECTIONS_TOPIC)?, QosProfile::default())?;
        let annotated = if config.publish_result_img {
            Some(self.bus.publisher::<Image>(
                &self.resolve(names::DETECTIONS_IMAGE_TOPIC)?,
                config.image_qos(),
            )?)
        } else {
            None
        };

        tracing::info!(
            model_type = %config.model_type,
            model = %config.model,
            device = %config.device(),
            encoding = %config.encoding,
            reliability = config.reliability.as_str(),
            publish_result_img = config.publish_result_img,
            "Configured"
        );

        self.auto_activate_pending = config.auto_activate;
        let processor = FrameProcessor::new(&config, detections, annotated);
        self.configured = Some(Configured { config, processor });
        Ok(())
    }

    fn on_activate(&mut self) -> Result<(), LifecycleError> {
        tracing::info!(node = %self.name, "Activating...");
        self.auto_activate_pending = false;

        let Some(configured) = self.configured.as_ref() else {
            return Err(LifecycleError::Activation("node has no configuration".to_string()));
        };
        let config = &configured.config;

        let spec = ModelSpec {
            model_type: config.model_type,
            model: &config.model,
            device: config.device(),
        };
        let mut detector = self.loader.load(&spec).map_err(|e| match e {
            InferenceError::ModelNotFound(_) => LifecycleError::ModelLoad {
                model: config.model.clone(),
                source: e,
            },
            other => LifecycleError::Activation(other.to_string()),
        })?;

        if let Err(e) = detector.fuse() {
            tracing::warn!(error = %e, "Error while fusing, continuing with unfused model");
        }

        let open_vocabulary = detector.capabilities().open_vocabulary;
        let image_qos = config.image_qos();
        let endpoints = self.register_endpoints(open_vocabulary, image_qos);
        let (enable_srv, classes_srv, subscription) = match endpoints {
            Ok(endpoints) => endpoints,
            Err(e) => {
                detector.release();
                return Err(LifecycleError::Activation(e.to_string()));
            }
        };

        tracing::info!(
            classes = detector.names().len(),
            open_vocabulary,
            "Activated"
        );
        self.active = Some(Active {
            subscription,
            enable_srv,
            classes_srv,
            detector,
        });
        Ok(())
    }

    /// Services first, image subscription last. Anything created before an
    /// error is dropped, which unregisters it.
    fn register_endpoints(
        &self,
        open_vocabulary: bool,
        image_qos: QosProfile,
    ) -> Result<(EnableServer, Option<ClassesServer>, Subscription<Image>), BridgeError> {
        let enable_srv = self
            .bus
            .create_service(&self.resolve(names::ENABLE_SERVICE)?)?;
        let classes_srv = if open_vocabulary {
            Some(
                self.bus
                    .create_service(&self.resolve(names::SET_CLASSES_SERVICE)?)?,
            )
        } else {
            None
        };
        let subscription = self
            .bus
            .subscribe::<Image>(&self.resolve(names::IMAGE_TOPIC)?, image_qos)?;
        Ok((enable_srv, classes_srv, subscription))
    }

    fn on_deactivate(&mut self) {
        tracing::info!(node = %self.name, "Deactivating...");

        if let Some(active) = self.active.take() {
            let Active {
                subscription,
                enable_srv,
                classes_srv,
                mut detector,
            } = active;
            drop(subscription);
            drop(enable_srv);
            drop(classes_srv);

            detector.release();
            if self
                .configured
                .as_ref()
                .is_some_and(|c| is_cuda_device(c.config.device()))
            {
                tracing::info!("Clearing CUDA cache");
            }
            drop(detector);
        }

        tracing::info!(node = %self.name, "Deactivated");
    }

    fn on_cleanup(&mut self) {
        tracing::info!(node = %self.name, "Cleaning up...");
        self.configured = None;
        self.auto_activate_pending = false;
        tracing::info!(node = %self.name, "Cleaned up");
    }

    fn on_shutdown(&mut self) {
        tracing::info!(node = %self.name, "Shutting down...");
        if self.active.is_some() {
            self.on_deactivate();
        }
        if self.configured.is_some() {
            self.on_cleanup();
        }
        tracing::info!(node = %self.name, "Shut down");
    }

    /// Toggle frame processing. Has no effect unless configured.
    pub fn set_enabled(&mut self, enabled: bool) {
        if let Some(configured) = self.configured.as_mut() {
            configured.processor.set_enabled(enabled);
            tracing::info!(enabled, "Detection toggled");
        }
    }

    /// Redefine the detector vocabulary and return the resulting label table.
    pub fn set_classes(&mut self, classes: &[String]) -> Result<Vec<String>, LifecycleError> {
        let active = self.active.as_mut().ok_or(LifecycleError::NotActive)?;
        tracing::info!(?classes, "Setting classes");
        active.detector.set_classes(classes)?;
        let names = active.detector.names().to_vec();
        tracing::info!(?names, "New classes");
        Ok(names)
    }

    /// Handle at most one pending event, waiting up to `timeout`. Returns
    /// whether anything was handled.
    pub fn spin_once(&mut self, timeout: Duration) -> bool {
        if self.auto_activate_pending && self.state() == LifecycleState::Inactive {
            tracing::info!(node = %self.name, "Auto-activating");
            // Failures are logged by trigger and not retried.
            let _ = self.trigger(Transition::Activate);
            return true;
        }

        let Some(event) = self.next_event(timeout) else {
            return false;
        };

        match event {
            Event::Image(image) => self.on_image(&image),
            Event::Enable(req) => {
                self.set_enabled(req.request.data);
                req.respond(SetBoolResponse {
                    success: true,
                    message: String::new(),
                });
            }
            Event::SetClasses(req) => {
                let response = match self.set_classes(&req.request.classes) {
                    Ok(classes) => SetClassesResponse {
                        success: true,
                        message: String::new(),
                        classes,
                    },
                    Err(e) => SetClassesResponse {
                        success: false,
                        message: e.to_string(),
                        classes: self.class_names().unwrap_or_default(),
                    },
                };
                req.respond(response);
            }
        }
        true
    }

    fn next_event(&self, timeout: Duration) -> Option<Event> {
        let Some(active) = self.active.as_ref() else {
            thread::sleep(timeout);
            return None;
        };

        let mut select = Select::new();
        let image_op = select.recv(active.subscription.receiver());
        select.recv(active.enable_srv.receiver());
        let classes_op = active
            .classes_srv
            .as_ref()
            .map(|srv| select.recv(srv.receiver()));

        let op = select.select_timeout(timeout).ok()?;
        let index = op.index();
        if index == image_op {
            return op.recv(active.subscription.receiver()).ok().map(Event::Image);
        }
        match active.classes_srv.as_ref() {
            Some(srv) if Some(index) == classes_op => {
                op.recv(srv.receiver()).ok().map(Event::SetClasses)
            }
            _ => op.recv(active.enable_srv.receiver()).ok().map(Event::Enable),
        }
    }

    fn on_image(&mut self, image: &Image) {
        let (Some(configured), Some(active)) = (self.configured.as_mut(), self.active.as_mut())
        else {
            return;
        };
        let Configured { config, processor } = configured;
        processor.handle(image, config, active.detector.as_mut());
    }
}

impl<L: DetectorLoader> Drop for YoloNode<L> {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Finalized {
            self.on_shutdown();
        }
    }
}
