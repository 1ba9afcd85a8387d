// skelfuse_core/src/math.rs
//
// Shared geometry/linear-algebra helpers. Everything that touches forward
// kinematics is generic over `ComplexField` so the same code evaluates both
// the production (f64) pose path and the complex-step differentiation path
// (Complex<f64>), without duplicating the kinematics.

use crate::types::{Transform3D, Transform3Dc};
use nalgebra::{
    Complex, ComplexField, DMatrix, Matrix3, Matrix3x4, Matrix4, Rotation3, UnitQuaternion,
    Vector3, Vector6,
};

/// Skew-symmetric (cross-product) matrix of `v`.
pub fn skew<T: ComplexField + Copy>(v: &Vector3<T>) -> Matrix3<T> {
    let z = T::zero();
    Matrix3::new(z, -v.z, v.y, v.z, z, -v.x, -v.y, v.x, z)
}

/// Rodrigues rotation about a fixed real axis by a (possibly complex) angle.
pub fn rotation_about_axis<T>(axis: &Vector3<f64>, angle: T) -> Matrix3<T>
where
    T: ComplexField<RealField = f64> + Copy,
{
    let k = skew(&axis.map(|a| T::from_real(a)));
    let k2 = k * k;
    Matrix3::identity() + k * angle.sin() + k2 * (T::one() - angle.cos())
}

/// Rotation matrix of an *unnormalized* quaternion (w, x, y, z), using the
/// norm-homogeneous formula R = M(q) / |q|^2. Avoids the square root so the
/// expression stays smooth for complex-step evaluation. A quaternion with
/// (near-)zero norm yields the identity; callers treat that state as invalid.
pub fn quat_rotation<T: ComplexField<RealField = f64> + Copy>(w: T, x: T, y: T, z: T) -> Matrix3<T> {
    let n2 = w * w + x * x + y * y + z * z;
    if n2.modulus() < 1e-12 {
        return Matrix3::identity();
    }
    let two = T::one() + T::one();
    let r = Matrix3::new(
        w * w + x * x - y * y - z * z,
        two * (x * y - w * z),
        two * (x * z + w * y),
        two * (x * y + w * z),
        w * w - x * x + y * y - z * z,
        two * (y * z - w * x),
        two * (x * z - w * y),
        two * (y * z + w * x),
        w * w - x * x - y * y + z * z,
    );
    r / n2
}

/// Assembles a homogeneous transform from a rotation block and translation.
pub fn homogeneous<T: ComplexField + Copy>(r: &Matrix3<T>, t: &Vector3<T>) -> Matrix4<T> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    m
}

/// Maps a homogeneous pose to its 6-vector (angle*axis, position)
/// representation, the coordinates the fusion update linearizes in.
///
/// The rotation part uses w = vee((R - R^T)/2) * theta/sin(theta). Near the
/// identity the acos/sin pair is replaced by its series (theta/sin(theta)
/// ~= 1 + (1 - cos(theta))/3), which is polynomial in the matrix entries and
/// therefore safe under complex-step perturbation, where acos sits on a
/// branch point at cos(theta) = 1. Rotations near pi are not special-cased;
/// per-frame segment rotations stay well inside (0, pi).
pub fn to_axis_angle_pos<T>(m: &Matrix4<T>) -> Vector6<T>
where
    T: ComplexField<RealField = f64> + Copy,
{
    let half = T::from_real(0.5);
    let one = T::one();
    let s = Vector3::new(
        (m[(2, 1)] - m[(1, 2)]) * half,
        (m[(0, 2)] - m[(2, 0)]) * half,
        (m[(1, 0)] - m[(0, 1)]) * half,
    );
    let c = (m[(0, 0)] + m[(1, 1)] + m[(2, 2)] - one) * half;
    // Scale articulations make the upper-left block non-orthogonal, so the
    // trace-derived cosine can land outside [-1, 1]; clamp to keep acos
    // off its branch cut (the +1 end then takes the series path).
    let c_re = c.real();
    let c = if c_re > 1.0 {
        T::from_real(1.0)
    } else if c_re < -1.0 {
        T::from_real(-1.0)
    } else {
        c
    };
    let one_minus_c = one - c;
    let factor = if one_minus_c.modulus() < 1e-8 {
        one + one_minus_c * T::from_real(1.0 / 3.0)
    } else {
        let theta = c.acos();
        theta / theta.sin()
    };
    let w = s * factor;
    let mut wp = Vector6::zeros();
    wp.fixed_rows_mut::<3>(0)
        .copy_from(&Vector3::new(w.x, w.y, w.z));
    wp.fixed_rows_mut::<3>(3)
        .copy_from(&Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]));
    wp
}

/// Rotation part of a (rigid) homogeneous transform as a unit quaternion.
pub fn rotation_part(t: &Transform3D) -> UnitQuaternion<f64> {
    let r = Rotation3::from_matrix_unchecked(t.fixed_view::<3, 3>(0, 0).into_owned());
    UnitQuaternion::from_rotation_matrix(&r)
}

/// Translation column of a homogeneous transform.
pub fn translation_part(t: &Transform3D) -> Vector3<f64> {
    t.fixed_view::<3, 1>(0, 3).into_owned()
}

/// Rigid homogeneous transform from rotation + translation.
pub fn transform_from_parts(rotation: &UnitQuaternion<f64>, translation: &Vector3<f64>) -> Transform3D {
    homogeneous(&rotation.to_rotation_matrix().into_inner(), translation)
}

/// Applies a homogeneous transform to a point.
pub fn transform_point(t: &Transform3D, p: &Vector3<f64>) -> Vector3<f64> {
    let hp = t * p.push(1.0);
    Vector3::new(hp.x, hp.y, hp.z)
}

/// Lifts a real transform into the complex field for complex-step work.
pub fn complexify(t: &Transform3D) -> Transform3Dc {
    t.map(|x| Complex::new(x, 0.0))
}

/// Jacobian of the axis-angle vector w = theta*n with respect to the
/// quaternion components, columns ordered (w, x, y, z). Used to map a
/// measurement's quaternion covariance into axis-angle space.
pub fn quat_to_axis_angle_jacobian(q: &UnitQuaternion<f64>) -> Matrix3x4<f64> {
    let a = q.coords.w;
    let v = Vector3::new(q.coords.x, q.coords.y, q.coords.z);
    let sv = v.norm();
    let mut jac = Matrix3x4::zeros();
    if sv < 1e-8 {
        // Near identity w ~= 2*v, independent of the scalar part.
        jac.fixed_view_mut::<3, 3>(0, 1)
            .copy_from(&(Matrix3::identity() * 2.0));
        return jac;
    }
    let theta = 2.0 * sv.atan2(a);
    let f = theta / sv;
    // d(theta/sv)/dsv folded with dsv/dv = v^T/sv.
    let g = 2.0 * a / (sv * sv) - theta / (sv * sv * sv);
    let block = Matrix3::identity() * f + v * v.transpose() * g;
    jac.fixed_view_mut::<3, 1>(0, 0).copy_from(&(v * -2.0));
    jac.fixed_view_mut::<3, 3>(0, 1).copy_from(&block);
    jac
}

/// Left quaternion-product matrix L(p) with q' = p * q, components ordered
/// (w, x, y, z). Transforms quaternion covariance under a calibration
/// rotation: Sigma' = L Sigma L^T.
pub fn quat_left_product_matrix(p: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (pw, px, py, pz) = (p.coords.w, p.coords.x, p.coords.y, p.coords.z);
    Matrix4::new(
        pw, -px, -py, -pz, //
        px, pw, -pz, py, //
        py, pz, pw, -px, //
        pz, -py, px, pw,
    )
}

/// Inverts a covariance/information matrix, preferring the Cholesky
/// factorization (which doubles as a positive-definiteness check) and
/// falling back to LU. `None` marks a singular or non-finite matrix; the
/// caller skips the update and flags the node instead of propagating NaNs.
pub fn invert_information(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.iter().any(|x| !x.is_finite()) {
        return None;
    }
    if let Some(chol) = m.clone().cholesky() {
        return Some(chol.inverse());
    }
    m.clone().try_inverse()
}

/// Forces exact symmetry after an update; fusion algebra is symmetric in
/// exact arithmetic but drifts in floating point.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let t = m.transpose();
    *m += t;
    *m *= 0.5;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{UnitVector3, Vector4};

    const EPS: f64 = 1e-9;

    #[test]
    fn rodrigues_matches_nalgebra_rotation() {
        let axis = UnitVector3::new_normalize(Vector3::new(0.3, -1.2, 0.5));
        let angle = 0.77;
        let r = rotation_about_axis(&axis.into_inner(), angle);
        let expected = Rotation3::from_axis_angle(&axis, angle);
        assert_abs_diff_eq!(r, *expected.matrix(), epsilon = EPS);
    }

    #[test]
    fn axis_angle_pos_round_trips() {
        let axis = UnitVector3::new_normalize(Vector3::new(1.0, 2.0, -0.5));
        let angle = 1.3;
        let q = UnitQuaternion::from_axis_angle(&axis, angle);
        let p = Vector3::new(0.1, -0.2, 0.3);
        let t = transform_from_parts(&q, &p);
        let wp = to_axis_angle_pos(&t);
        assert_abs_diff_eq!(wp.fixed_rows::<3>(0).into_owned(), q.scaled_axis(), epsilon = EPS);
        assert_abs_diff_eq!(wp.fixed_rows::<3>(3).into_owned(), p, epsilon = EPS);
    }

    #[test]
    fn axis_angle_pos_near_identity() {
        let q = UnitQuaternion::from_scaled_axis(Vector3::new(1e-6, -2e-6, 5e-7));
        let t = transform_from_parts(&q, &Vector3::zeros());
        let wp = to_axis_angle_pos(&t);
        assert_abs_diff_eq!(wp.fixed_rows::<3>(0).into_owned(), q.scaled_axis(), epsilon = 1e-12);
    }

    #[test]
    fn axis_angle_pos_stays_finite_on_scaled_transforms() {
        // A uniform scale pushes the trace-derived cosine above 1; the
        // mapping must stay finite instead of feeding acos out of domain.
        let t: Transform3D = Matrix4::identity() * 2.0;
        let wp = to_axis_angle_pos(&t);
        assert!(wp.iter().all(|x| x.is_finite()));
        // The scaled identity carries no skew part, so no spurious rotation.
        assert_abs_diff_eq!(wp.fixed_rows::<3>(0).into_owned(), Vector3::zeros(), epsilon = EPS);
    }

    #[test]
    fn quat_rotation_matches_unit_quaternion() {
        let q = UnitQuaternion::from_euler_angles(0.2, -0.4, 1.1);
        // Scale the components to check norm-homogeneity.
        let s = 2.5;
        let c = q.coords;
        let r = quat_rotation(c.w * s, c.x * s, c.y * s, c.z * s);
        assert_abs_diff_eq!(r, q.to_rotation_matrix().into_inner(), epsilon = EPS);
    }

    #[test]
    fn quat_jacobian_matches_finite_difference() {
        let q = UnitQuaternion::from_euler_angles(0.3, 0.5, -0.2);
        let jac = quat_to_axis_angle_jacobian(&q);
        let coords = Vector4::new(q.coords.w, q.coords.x, q.coords.y, q.coords.z);
        let h = 1e-6;
        for col in 0..4 {
            let mut plus = coords;
            let mut minus = coords;
            plus[col] += h;
            minus[col] -= h;
            // Renormalization is deliberately skipped: the Jacobian is of the
            // raw quaternion-to-axis-angle map, matching how the measurement
            // covariance lives in raw component space.
            let f = |c: Vector4<f64>| {
                let sv = Vector3::new(c[1], c[2], c[3]);
                let theta = 2.0 * sv.norm().atan2(c[0]);
                sv * (theta / sv.norm())
            };
            let numeric = (f(plus) - f(minus)) / (2.0 * h);
            assert_abs_diff_eq!(jac.column(col).into_owned(), numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn invert_information_rejects_singular() {
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(invert_information(&singular).is_none());

        let spd = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let inv = invert_information(&spd).unwrap();
        let id = &spd * &inv;
        assert_abs_diff_eq!(id, DMatrix::identity(2, 2), epsilon = EPS);
    }

    #[test]
    fn complex_step_through_axis_angle() {
        // d/dtheta of the axis-angle vector of a rotation about a fixed axis
        // is the axis itself; the complex step must recover it exactly.
        let axis = UnitVector3::new_normalize(Vector3::new(0.0, 1.0, 1.0));
        let h = 1e-20;
        let theta = Complex::new(0.6, h);
        let r = rotation_about_axis(&axis.into_inner(), theta);
        let t = homogeneous(&r, &Vector3::zeros().map(|x| Complex::new(x, 0.0)));
        let wp = to_axis_angle_pos(&t);
        let deriv = Vector3::new(wp[0].im / h, wp[1].im / h, wp[2].im / h);
        assert_abs_diff_eq!(deriv, axis.into_inner(), epsilon = 1e-12);
    }
}
