use crate::{
    BridgeError, Bus,
    bus::{Registry, ServiceEntry, lock},
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::{marker::PhantomData, sync::Arc, time::Duration};

/// One incoming call. Dropping it without responding makes the caller see
/// the service as unavailable.
pub struct ServiceRequest<Req, Resp> {
    pub request: Req,
    reply: Sender<Resp>,
}

impl<Req, Resp> ServiceRequest<Req, Resp> {
    /// Returns false if the caller stopped waiting.
    pub fn respond(self, response: Resp) -> bool {
        self.reply.send(response).is_ok()
    }
}

type Endpoint<Req, Resp> = Sender<ServiceRequest<Req, Resp>>;

pub struct ServiceServer<Req, Resp> {
    name: String,
    id: u64,
    rx: Receiver<ServiceRequest<Req, Resp>>,
    registry: Arc<Registry>,
}

impl<Req, Resp> ServiceServer<Req, Resp> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying request queue, for use with `crossbeam_channel::Select`.
    pub fn receiver(&self) -> &Receiver<ServiceRequest<Req, Resp>> {
        &self.rx
    }
}

impl<Req, Resp> Drop for ServiceServer<Req, Resp> {
    fn drop(&mut self) {
        let mut services = lock(&self.registry.services);
        if services.get(&self.name).is_some_and(|entry| entry.id == self.id) {
            services.remove(&self.name);
        }
        tracing::debug!(service = %self.name, "Service destroyed");
    }
}

pub struct ServiceClient<Req, Resp> {
    name: String,
    registry: Arc<Registry>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> ServiceClient<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        lock(&self.registry.services).contains_key(&self.name)
    }

    /// Blocking call. The server answers from its own execution context, so
    /// the timeout bounds how long the caller waits for it to get there.
    pub fn call(&self, request: Req, timeout: Duration) -> Result<Resp, BridgeError> {
        let endpoint = {
            let services = lock(&self.registry.services);
            let entry = services
                .get(&self.name)
                .ok_or_else(|| BridgeError::ServiceUnavailable(self.name.clone()))?;
            Arc::clone(&entry.endpoint)
                .downcast::<Endpoint<Req, Resp>>()
                .map_err(|_| BridgeError::ServiceTypeMismatch(self.name.clone()))?
        };

        let (reply, response) = crossbeam_channel::bounded(1);
        endpoint
            .send(ServiceRequest { request, reply })
            .map_err(|_| BridgeError::ServiceUnavailable(self.name.clone()))?;

        response.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => BridgeError::ServiceTimeout {
                service: self.name.clone(),
                timeout,
            },
            RecvTimeoutError::Disconnected => BridgeError::ServiceUnavailable(self.name.clone()),
        })
    }
}

impl Bus {
    pub fn create_service<Req, Resp>(
        &self,
        name: &str,
    ) -> Result<ServiceServer<Req, Resp>, BridgeError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let mut services = lock(&self.registry.services);
        if services.contains_key(name) {
            return Err(BridgeError::ServiceAlreadyExists(name.to_string()));
        }

        let (tx, rx) = crossbeam_channel::unbounded::<ServiceRequest<Req, Resp>>();
        let id = self.registry.next_id();
        services.insert(
            name.to_string(),
            ServiceEntry {
                id,
                endpoint: Arc::new(tx),
            },
        );
        tracing::debug!(service = %name, "Service created");

        Ok(ServiceServer {
            name: name.to_string(),
            id,
            rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Clients resolve the service on every call, so they may be created
    /// before the server exists and survive its restarts.
    pub fn client<Req, Resp>(&self, name: &str) -> ServiceClient<Req, Resp> {
        ServiceClient {
            name: name.to_string(),
            registry: Arc::clone(&self.registry),
            _marker: PhantomData,
        }
    }
}
