use serde_derive::Serialize;

pub type DistanceKm = f64;

fn deg2rad(x: f64) -> f64 {
    std::f64::consts::PI * x / 180.0
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Location {
        Location {
            latitude: lat,
            longitude: lon,
        }
    }

    /// Haversine great-circle distance, used for run statistics.
    pub fn distance_to(&self, other: &Location) -> DistanceKm {
        let lat_diff_sin = ((deg2rad(self.latitude) - deg2rad(other.latitude)) / 2.).sin();
        let lon_diff_sin = ((deg2rad(self.longitude) - deg2rad(other.longitude)) / 2.).sin();
        let h = lat_diff_sin * lat_diff_sin
            + deg2rad(self.latitude).cos()
                * deg2rad(other.latitude).cos()
                * lon_diff_sin
                * lon_diff_sin;
        let r = 6360.0;
        2.0 * r * h.sqrt().asin()
    }
}
