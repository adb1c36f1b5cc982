use crate::extract::ExtractedWay;
use serde_json::{Map, Value};
use std::io::{self, Write};

/// Sink for extracted ways. The result set is restartable, so the same
/// extraction can be driven through several writers.
pub trait WayWriter {
    fn write(&mut self, way: &ExtractedWay) -> io::Result<()>;

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streams a GeoJSON FeatureCollection of LineString features. Tags become
/// feature properties, plus a `degraded` flag for incomplete geometries.
pub struct GeoJsonWriter<W: Write> {
    out: W,
    written: usize,
}

impl<W: Write> GeoJsonWriter<W> {
    pub fn new(mut out: W) -> io::Result<GeoJsonWriter<W>> {
        out.write_all(b"{\"type\":\"FeatureCollection\",\"features\":[")?;
        Ok(GeoJsonWriter { out, written: 0 })
    }
}

impl<W: Write> WayWriter for GeoJsonWriter<W> {
    fn write(&mut self, way: &ExtractedWay) -> io::Result<()> {
        // RFC 7946 requires at least two positions in a LineString; shorter
        // geometries (degraded or zero-ref ways) get a null geometry.
        let geometry = if way.geometry.len() >= 2 {
            let coordinates: Vec<[f64; 2]> = way
                .geometry
                .iter()
                .map(|location| [location.longitude, location.latitude])
                .collect();
            serde_json::json!({
                "type": "LineString",
                "coordinates": coordinates,
            })
        } else {
            Value::Null
        };
        let mut properties = Map::new();
        for (k, v) in way.tags.iter() {
            properties.insert(k.clone(), Value::String(v.clone()));
        }
        properties.insert("degraded".to_string(), Value::Bool(way.degraded));
        let feature = serde_json::json!({
            "type": "Feature",
            "id": way.id,
            "properties": properties,
            "geometry": geometry,
        });

        if self.written > 0 {
            self.out.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.out, &feature)?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.write_all(b"]}")?;
        self.out.flush()
    }
}

/// One row per way: id, degraded flag, vertex count, and the vertex list as
/// `lat lon` pairs joined with `;`.
pub struct CsvWriter<W: Write> {
    out: W,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(mut out: W) -> io::Result<CsvWriter<W>> {
        writeln!(out, "way_id,degraded,vertex_count,geometry")?;
        Ok(CsvWriter { out })
    }
}

impl<W: Write> WayWriter for CsvWriter<W> {
    fn write(&mut self, way: &ExtractedWay) -> io::Result<()> {
        let vertices: Vec<String> = way
            .geometry
            .iter()
            .map(|location| format!("{} {}", location.latitude, location.longitude))
            .collect();
        writeln!(
            self.out,
            "{},{},{},{}",
            way.id,
            way.degraded,
            way.geometry.len(),
            vertices.join(";")
        )
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
