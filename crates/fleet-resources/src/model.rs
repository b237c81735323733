use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Order resource. Only the fields the live core reads are typed; everything
/// else the backend sends is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub driver_assigned: Option<DriverRef>,
    #[serde(default)]
    pub payload: Option<OrderPayload>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Order {
    /// Minimal order with only an id, mostly useful in tests and fixtures.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: None,
            driver_assigned: None,
            payload: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_assigned = Some(DriverRef {
            id: driver_id.into(),
            name: None,
            extra: Map::new(),
        });
        self
    }

    #[must_use]
    pub fn with_pickup_street(mut self, street1: impl Into<String>) -> Self {
        let payload = self.payload.get_or_insert_with(OrderPayload::default);
        payload
            .pickup
            .get_or_insert_with(Place::default)
            .street1 = Some(street1.into());
        self
    }

    /// Serialized form handed to order callbacks.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn assigned_driver_id(&self) -> Option<&str> {
        self.driver_assigned.as_ref().map(|driver| driver.id.as_str())
    }

    /// True only when the order carries an assignment to exactly this driver.
    pub fn is_assigned_to(&self, driver: &Driver) -> bool {
        self.assigned_driver_id() == Some(driver.id.as_str())
    }

    pub fn pickup_street(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.pickup.as_ref())
            .and_then(|place| place.street1.as_deref())
            .map(str::trim)
            .filter(|street| !street.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    #[serde(default)]
    pub pickup: Option<Place>,
    #[serde(default)]
    pub dropoff: Option<Place>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Place {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Driver reference embedded in an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The driver this device is signed in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Driver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}
